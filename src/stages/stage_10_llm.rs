//! Stage 10: LLM extractions.
//!
//! Per message, asks the configured LLM for structured
//! {intent, task_type, code_languages, complexity, has_code_block}.
//! A parse failure or exhausted retry records a signal and writes the
//! row with null fields so downstream coverage metrics stay honest.
//! Disabled provider: no-op.

use anyhow::Result;
use sqlx::Row;
use tracing::{info, warn};

use crate::llm::{extract, LlmExtraction};
use crate::provenance::record_signal;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(10);

    if !ctx.config.llm.is_enabled() {
        outcome.note("llm provider disabled; stage skipped");
        return Ok(outcome);
    }

    let created_at = now_utc();
    let input = ctx.table(7)?;
    let output = ctx.table(10)?;

    let rows = sqlx::query(&format!(
        "SELECT entity_id, session_id, text FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    for row in &rows {
        outcome.rows_in += 1;

        let text: Option<String> = row.try_get("text")?;
        let Some(text) = text else { continue };
        if text.trim().is_empty() {
            continue;
        }

        let entity_id: String = row.try_get("entity_id")?;
        let session_id: String = row.try_get("session_id")?;

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let extraction = match extract(&ctx.config.llm, &text).await {
            Ok(e) => e,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "llm extraction failed");
                record_signal(
                    ctx.pool,
                    10,
                    &ctx.run_id,
                    Some(&entity_id),
                    "llm_extraction_failed",
                    &e.to_string(),
                )
                .await?;
                outcome.skipped += 1;
                LlmExtraction::default()
            }
        };

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, intent, task_type, code_languages, complexity, has_code_block,
             session_id, created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&entity_id)
        .bind(&extraction.intent)
        .bind(&extraction.task_type)
        .bind(serde_json::to_string(&extraction.code_languages)?)
        .bind(&extraction.complexity)
        .bind(extraction.has_code_block.map(|b| b as i64))
        .bind(&session_id)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(&created_at)
        .bind(&created_at)
        .execute(ctx.pool)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    info!(
        run_id = %ctx.run_id,
        extracted = outcome.rows_out,
        failed = outcome.skipped,
        "llm extraction complete"
    );
    Ok(outcome)
}
