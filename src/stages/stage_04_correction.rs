//! Stage 4: text correction.
//!
//! Unicode NFC normalization, confident mojibake repair, and leaked
//! escape-sequence restoration over the identified rows. Counts are
//! recomputed after repair so downstream word counting stays honest.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::textutil::{char_count, now_utc, repair_text, word_count};

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 3).await?;

    let mut outcome = StageOutcome::new(4);
    let corrected_at = now_utc();
    let input = ctx.table(3)?;
    let output = ctx.table(4)?;

    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let content: Option<String> = row.try_get("content")?;
        let repaired = content.as_deref().map(repair_text);
        let content_length = repaired.as_deref().map(char_count).unwrap_or(0);
        let words = repaired.as_deref().map(word_count).unwrap_or(0);

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let timestamp_utc: Option<String> = row.try_get("timestamp_utc")?;
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, extraction_id, session_id, message_index, message_type, role,
             content, content_length, word_count, model, cost_usd, tool_name,
             source_file, content_date, timestamp_utc, fingerprint, is_duplicate,
             identity_created_at, corrected_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(row.try_get::<String, _>("entity_id")?)
        .bind(row.try_get::<String, _>("extraction_id")?)
        .bind(row.try_get::<String, _>("session_id")?)
        .bind(row.try_get::<i64, _>("message_index")?)
        .bind(row.try_get::<String, _>("message_type")?)
        .bind(row.try_get::<Option<String>, _>("role")?)
        .bind(&repaired)
        .bind(content_length)
        .bind(words)
        .bind(row.try_get::<Option<String>, _>("model")?)
        .bind(row.try_get::<Option<f64>, _>("cost_usd")?)
        .bind(row.try_get::<Option<String>, _>("tool_name")?)
        .bind(row.try_get::<String, _>("source_file")?)
        .bind(row.try_get::<Option<String>, _>("content_date")?)
        .bind(&timestamp_utc)
        .bind(row.try_get::<String, _>("fingerprint")?)
        .bind(row.try_get::<i64, _>("is_duplicate")?)
        .bind(row.try_get::<String, _>("identity_created_at")?)
        .bind(&corrected_at)
        .bind(&ctx.run_id)
        .bind(timestamp_utc.as_deref().unwrap_or(&corrected_at))
        .bind(&corrected_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, corrected = outcome.rows_out, "text correction complete");
    Ok(outcome)
}
