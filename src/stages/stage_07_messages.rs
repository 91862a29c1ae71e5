//! Stage 7: canonical L5 messages.
//!
//! Re-emits each corrected message as the canonical message entity,
//! linked to its L8 conversation through `parent_id`. Identity is
//! preserved from The Gate; this stage only reshapes.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::identity::conversation_id;
use crate::models::Level;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 4).await?;

    let mut outcome = StageOutcome::new(7);
    let created_at = now_utc();
    let input = ctx.table(4)?;
    let output = ctx.table(7)?;

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

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let session_id: String = row.try_get("session_id")?;
        let parent_id = conversation_id(ctx.source(), &session_id);
        let timestamp_utc: Option<String> = row.try_get("timestamp_utc")?;

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, parent_id, source_name, source_pipeline, level, text, role,
             message_type, message_index, word_count, char_count, model, cost_usd,
             tool_name, session_id, content_date, timestamp_utc, fingerprint,
             created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(row.try_get::<String, _>("entity_id")?)
        .bind(&parent_id)
        .bind(ctx.source())
        .bind(ctx.pipeline())
        .bind(Level::Message.as_i64())
        .bind(row.try_get::<Option<String>, _>("content")?)
        .bind(row.try_get::<Option<String>, _>("role")?)
        .bind(row.try_get::<String, _>("message_type")?)
        .bind(row.try_get::<i64, _>("message_index")?)
        .bind(row.try_get::<i64, _>("word_count")?)
        .bind(row.try_get::<i64, _>("content_length")?)
        .bind(row.try_get::<Option<String>, _>("model")?)
        .bind(row.try_get::<Option<f64>, _>("cost_usd")?)
        .bind(row.try_get::<Option<String>, _>("tool_name")?)
        .bind(&session_id)
        .bind(row.try_get::<Option<String>, _>("content_date")?)
        .bind(&timestamp_utc)
        .bind(row.try_get::<String, _>("fingerprint")?)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(timestamp_utc.as_deref().unwrap_or(&created_at))
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, messages = outcome.rows_out, "canonical messages complete");
    Ok(outcome)
}
