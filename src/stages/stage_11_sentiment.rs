//! Stage 11: sentiment.
//!
//! Runs the configured emotion classifier over each message. The
//! top-scoring label becomes `primary_emotion`; the full distribution is
//! stored, and weak labels fall out of `emotions_detected` per the
//! configured threshold. Disabled provider: no-op.

use anyhow::Result;
use sqlx::Row;
use tracing::{info, warn};

use crate::provenance::record_signal;
use crate::sentiment::classify;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(11);

    if !ctx.config.sentiment.is_enabled() {
        outcome.note("sentiment provider disabled; stage skipped");
        return Ok(outcome);
    }

    let created_at = now_utc();
    let input = ctx.table(7)?;
    let output = ctx.table(11)?;

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

        let result = match classify(&ctx.config.sentiment, &text).await {
            Ok(r) => r,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "sentiment classification failed");
                record_signal(
                    ctx.pool,
                    11,
                    &ctx.run_id,
                    Some(&entity_id),
                    "sentiment_failed",
                    &e.to_string(),
                )
                .await?;
                outcome.skipped += 1;
                continue;
            }
        };

        let all_scores: serde_json::Map<String, serde_json::Value> = result
            .all_scores
            .iter()
            .map(|(label, score)| (label.clone(), serde_json::json!(score)))
            .collect();

        let insert = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, primary_emotion, primary_emotion_score, emotions_detected,
             all_emotion_scores, session_id, created_at, run_id,
             valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&entity_id)
        .bind(&result.primary_emotion)
        .bind(result.primary_emotion_score)
        .bind(serde_json::to_string(&result.detected)?)
        .bind(serde_json::to_string(&all_scores)?)
        .bind(&session_id)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(&created_at)
        .bind(&created_at)
        .execute(ctx.pool)
        .await?;
        outcome.rows_out += insert.rows_affected();
    }

    info!(
        run_id = %ctx.run_id,
        classified = outcome.rows_out,
        failed = outcome.skipped,
        "sentiment complete"
    );
    Ok(outcome)
}
