//! Stage 6: sentence detection.
//!
//! Segments each corrected message into sentences and emits one entity
//! per sentence with its index, character span, and word count. The
//! emitted level (L3 or L4) is part of this adapter's data contract:
//! consumers must read the contract rather than assume. Empty messages
//! yield no rows.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::identity::sentence_id;
use crate::sentence::segment;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 4).await?;

    let mut outcome = StageOutcome::new(6);
    let created_at = now_utc();
    let level = ctx.config.pipeline.sentence_level;
    let input = ctx.table(4)?;
    let output = ctx.table(6)?;

    let rows = sqlx::query(&format!(
        "SELECT entity_id, session_id, content, content_date, timestamp_utc FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let content: Option<String> = row.try_get("content")?;
        let Some(text) = content else { continue };
        if text.trim().is_empty() {
            continue;
        }

        let parent_id: String = row.try_get("entity_id")?;
        let session_id: String = row.try_get("session_id")?;
        let content_date: Option<String> = row.try_get("content_date")?;
        let timestamp_utc: Option<String> = row.try_get("timestamp_utc")?;

        for sentence in segment(&text) {
            if ctx.opts.dry_run {
                outcome.rows_out += 1;
                continue;
            }

            let entity_id = sentence_id(&parent_id, sentence.index);
            let result = sqlx::query(&format!(
                r#"
                INSERT OR IGNORE INTO {}
                (entity_id, parent_id, source_name, source_pipeline, level, text,
                 sentence_index, start_char, end_char, word_count, session_id,
                 content_date, created_at, run_id, valid_time, system_time, valid_to)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
                output
            ))
            .bind(&entity_id)
            .bind(&parent_id)
            .bind(ctx.source())
            .bind(ctx.pipeline())
            .bind(level)
            .bind(&sentence.text)
            .bind(sentence.index)
            .bind(sentence.start_char)
            .bind(sentence.end_char)
            .bind(sentence.word_count)
            .bind(&session_id)
            .bind(&content_date)
            .bind(&created_at)
            .bind(&ctx.run_id)
            .bind(timestamp_utc.as_deref().unwrap_or(&created_at))
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
            outcome.rows_out += result.rows_affected();
        }
    }

    tx.commit().await?;

    info!(
        run_id = %ctx.run_id,
        sentences = outcome.rows_out,
        level,
        "sentence detection complete"
    );
    Ok(outcome)
}
