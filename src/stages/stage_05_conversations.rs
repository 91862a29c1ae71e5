//! Stage 5: L8 conversations.
//!
//! Groups corrected messages by session and emits one conversation
//! entity per session with aggregate counters, the first/last message
//! timestamps, and the distinct models and tools seen. Conversations
//! are hierarchy roots: `parent_id` is NULL and `level` is always 8.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::identity::conversation_id;
use crate::models::Level;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

#[derive(Debug, Default)]
struct ConversationAccum {
    message_count: i64,
    user_message_count: i64,
    assistant_message_count: i64,
    tool_use_count: i64,
    total_word_count: i64,
    total_char_count: i64,
    total_cost_usd: f64,
    first_message_at: Option<String>,
    last_message_at: Option<String>,
    models_used: BTreeSet<String>,
    tools_used: BTreeSet<String>,
    content_date: Option<String>,
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 4).await?;

    let mut outcome = StageOutcome::new(5);
    let created_at = now_utc();
    let input = ctx.table(4)?;
    let output = ctx.table(5)?;

    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut sessions: BTreeMap<String, ConversationAccum> = BTreeMap::new();

    for row in &rows {
        outcome.rows_in += 1;

        let session_id: String = row.try_get("session_id")?;
        let accum = sessions.entry(session_id).or_default();

        accum.message_count += 1;
        match row.try_get::<Option<String>, _>("role")?.as_deref() {
            Some("user") => accum.user_message_count += 1,
            Some("assistant") => accum.assistant_message_count += 1,
            Some("tool") => accum.tool_use_count += 1,
            _ => {}
        }
        accum.total_word_count += row.try_get::<i64, _>("word_count")?;
        accum.total_char_count += row.try_get::<i64, _>("content_length")?;
        accum.total_cost_usd += row.try_get::<Option<f64>, _>("cost_usd")?.unwrap_or(0.0);

        if let Some(ts) = row.try_get::<Option<String>, _>("timestamp_utc")? {
            if accum.first_message_at.as_deref().map_or(true, |f| ts.as_str() < f) {
                accum.first_message_at = Some(ts.clone());
            }
            if accum.last_message_at.as_deref().map_or(true, |l| ts.as_str() > l) {
                accum.last_message_at = Some(ts);
            }
        }
        if let Some(model) = row.try_get::<Option<String>, _>("model")? {
            accum.models_used.insert(model);
        }
        if let Some(tool) = row.try_get::<Option<String>, _>("tool_name")? {
            accum.tools_used.insert(tool);
        }
        if accum.content_date.is_none() {
            accum.content_date = row.try_get::<Option<String>, _>("content_date")?;
        }
    }

    if ctx.opts.dry_run {
        outcome.note(format!("dry-run: {} conversations", sessions.len()));
        return Ok(outcome);
    }

    let mut tx = ctx.pool.begin().await?;

    for (session_id, accum) in &sessions {
        let entity_id = conversation_id(ctx.source(), session_id);
        let models: Vec<&String> = accum.models_used.iter().collect();
        let tools: Vec<&String> = accum.tools_used.iter().collect();

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, parent_id, source_name, source_pipeline, level, session_id,
             message_count, user_message_count, assistant_message_count, tool_use_count,
             total_word_count, total_char_count, total_cost_usd,
             first_message_at, last_message_at, models_used, tools_used,
             content_date, created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&entity_id)
        .bind(ctx.source())
        .bind(ctx.pipeline())
        .bind(Level::Conversation.as_i64())
        .bind(session_id)
        .bind(accum.message_count)
        .bind(accum.user_message_count)
        .bind(accum.assistant_message_count)
        .bind(accum.tool_use_count)
        .bind(accum.total_word_count)
        .bind(accum.total_char_count)
        .bind(accum.total_cost_usd)
        .bind(&accum.first_message_at)
        .bind(&accum.last_message_at)
        .bind(serde_json::to_string(&models)?)
        .bind(serde_json::to_string(&tools)?)
        .bind(&accum.content_date)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(accum.first_message_at.as_deref().unwrap_or(&created_at))
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, conversations = outcome.rows_out, "conversation derivation complete");
    Ok(outcome)
}
