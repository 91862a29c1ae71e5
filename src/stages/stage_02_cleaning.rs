//! Stage 2: cleaning.
//!
//! Normalizes extracted text (control characters, whitespace runs, line
//! endings), recomputes length and word counts, and flags duplicate
//! messages by fingerprint equivalence within the run. Content meaning
//! is never altered.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::textutil::{char_count, clean_text, now_utc, word_count};

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 1).await?;

    let mut outcome = StageOutcome::new(2);
    let cleaned_at = now_utc();
    let input = ctx.table(1)?;
    let output = ctx.table(2)?;

    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut seen_fingerprints: HashSet<String> = HashSet::new();
    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let content: Option<String> = row.try_get("content")?;
        let cleaned = content.as_deref().map(clean_text);
        let content_length = cleaned.as_deref().map(char_count).unwrap_or(0);
        let words = cleaned.as_deref().map(word_count).unwrap_or(0);

        let fingerprint: String = row.try_get("fingerprint")?;
        let is_duplicate = !seen_fingerprints.insert(fingerprint.clone());

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let timestamp_utc: Option<String> = row.try_get("timestamp_utc")?;
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (extraction_id, session_id, message_index, message_type, role, content,
             content_length, word_count, model, cost_usd, tool_name, source_file,
             content_date, timestamp_utc, fingerprint, is_duplicate, cleaned_at,
             run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(row.try_get::<String, _>("extraction_id")?)
        .bind(row.try_get::<String, _>("session_id")?)
        .bind(row.try_get::<i64, _>("message_index")?)
        .bind(row.try_get::<String, _>("message_type")?)
        .bind(row.try_get::<Option<String>, _>("role")?)
        .bind(&cleaned)
        .bind(content_length)
        .bind(words)
        .bind(row.try_get::<Option<String>, _>("model")?)
        .bind(row.try_get::<Option<f64>, _>("cost_usd")?)
        .bind(row.try_get::<Option<String>, _>("tool_name")?)
        .bind(row.try_get::<String, _>("source_file")?)
        .bind(row.try_get::<Option<String>, _>("content_date")?)
        .bind(&timestamp_utc)
        .bind(&fingerprint)
        .bind(is_duplicate as i64)
        .bind(&cleaned_at)
        .bind(&ctx.run_id)
        .bind(timestamp_utc.as_deref().unwrap_or(&cleaned_at))
        .bind(&cleaned_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, cleaned = outcome.rows_out, "cleaning complete");
    Ok(outcome)
}
