//! Stage 9: embeddings.
//!
//! Batches canonical message text through the configured embedding
//! provider. Text is truncated to the provider budget first; a batch
//! that exhausts its retries records a signal and is skipped rather
//! than failing the stage. Disabled provider: the stage is a no-op so
//! the rest of the pipeline can proceed without network access.

use anyhow::Result;
use sqlx::Row;
use tracing::{info, warn};

use crate::embedding::{create_provider, embed_texts, vec_to_blob};
use crate::provenance::record_signal;
use crate::textutil::{now_utc, truncate_text};

use super::{ensure_input_rows, StageContext, StageOutcome};

struct PendingText {
    entity_id: String,
    session_id: String,
    text: String,
    was_truncated: bool,
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(9);

    if !ctx.config.embedding.is_enabled() {
        outcome.note("embedding provider disabled; stage skipped");
        return Ok(outcome);
    }

    let provider = create_provider(&ctx.config.embedding)?;
    let model_name = provider.model_name().to_string();
    let dims = provider.dims() as i64;
    let created_at = now_utc();
    let input = ctx.table(7)?;
    let output = ctx.table(9)?;

    let rows = sqlx::query(&format!(
        "SELECT entity_id, session_id, text FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut pending = Vec::new();
    for row in &rows {
        outcome.rows_in += 1;
        let text: Option<String> = row.try_get("text")?;
        let Some(text) = text else { continue };
        if text.trim().is_empty() {
            continue;
        }
        let (truncated_text, was_truncated) =
            truncate_text(&text, ctx.config.embedding.max_chars);
        pending.push(PendingText {
            entity_id: row.try_get("entity_id")?,
            session_id: row.try_get("session_id")?,
            text: truncated_text,
            was_truncated,
        });
    }

    if ctx.opts.dry_run {
        outcome.note(format!("dry-run: would embed {} texts", pending.len()));
        return Ok(outcome);
    }

    for batch in pending.chunks(ctx.config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        let vectors = match embed_texts(&ctx.config.embedding, &texts).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, batch = batch.len(), "embedding batch failed after retries");
                for item in batch {
                    record_signal(
                        ctx.pool,
                        9,
                        &ctx.run_id,
                        Some(&item.entity_id),
                        "embedding_failed",
                        &e.to_string(),
                    )
                    .await?;
                    outcome.skipped += 1;
                }
                continue;
            }
        };

        let mut tx = ctx.pool.begin().await?;
        for (item, vector) in batch.iter().zip(vectors.iter()) {
            let result = sqlx::query(&format!(
                r#"
                INSERT OR IGNORE INTO {}
                (entity_id, embedding, embedding_model, embedding_dimension,
                 was_truncated, session_id, created_at, run_id,
                 valid_time, system_time, valid_to)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
                output
            ))
            .bind(&item.entity_id)
            .bind(vec_to_blob(vector))
            .bind(&model_name)
            .bind(dims)
            .bind(item.was_truncated as i64)
            .bind(&item.session_id)
            .bind(&created_at)
            .bind(&ctx.run_id)
            .bind(&created_at)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
            outcome.rows_out += result.rows_affected();
        }
        tx.commit().await?;
    }

    info!(
        run_id = %ctx.run_id,
        embedded = outcome.rows_out,
        skipped = outcome.skipped,
        "embedding complete"
    );
    Ok(outcome)
}
