//! Stage 12: topics / keywords.
//!
//! Extracts the top-N scored keywords per message. Fully offline and
//! deterministic; texts under the configured minimum length yield an
//! empty keyword list (still written, so coverage is observable).

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::keywords::extract_keywords;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(12);
    let created_at = now_utc();
    let input = ctx.table(7)?;
    let output = ctx.table(12)?;
    let top_n = ctx.config.keywords.top_n;
    let min_len = ctx.config.keywords.min_text_len;

    let rows = sqlx::query(&format!(
        "SELECT entity_id, session_id, text FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let text: Option<String> = row.try_get("text")?;
        let Some(text) = text else { continue };

        let entity_id: String = row.try_get("entity_id")?;
        let session_id: String = row.try_get("session_id")?;

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let keywords = extract_keywords(&text, top_n, min_len);
        let top_keyword = keywords.first().map(|(k, _)| k.clone());
        let pairs: Vec<serde_json::Value> = keywords
            .iter()
            .map(|(k, s)| serde_json::json!({ "keyword": k, "score": s }))
            .collect();

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, keywords, top_keyword, keyword_count, session_id,
             created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&entity_id)
        .bind(serde_json::to_string(&pairs)?)
        .bind(&top_keyword)
        .bind(keywords.len() as i64)
        .bind(&session_id)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, keyword_rows = outcome.rows_out, "keyword extraction complete");
    Ok(outcome)
}
