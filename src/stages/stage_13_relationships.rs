//! Stage 13: relationships.
//!
//! Emits two edge families over the derived entities:
//! - `parent_child`: one structural edge per (parent, child) pair across
//!   the conversation/message/sentence/span tables.
//! - sequential: within a session, messages ordered by (timestamp, index)
//!   produce REPLIES_TO on user → assistant transitions and CONTINUES on
//!   assistant → user. Other transitions emit nothing.
//!
//! Edge ids are deterministic over (source, target, type), so re-runs
//! reproduce identical keys.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::identity::relationship_id;
use crate::models::{rel, Level};
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

struct Edge {
    source_id: String,
    target_id: String,
    rel_type: &'static str,
    source_level: i64,
    target_level: i64,
    session_id: Option<String>,
    content_date: Option<String>,
}

/// Edge type for an adjacent message pair, or None when the transition
/// carries no sequential meaning (tool output, same-role runs, system).
fn sequential_rel_type(prev_role: Option<&str>, role: Option<&str>) -> Option<&'static str> {
    match (prev_role, role) {
        (Some("user"), Some("assistant")) => Some(rel::REPLIES_TO),
        (Some("assistant"), Some("user")) => Some(rel::CONTINUES),
        _ => None,
    }
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(13);
    let created_at = now_utc();
    let output = ctx.table(13)?;
    let sentence_level = ctx.config.pipeline.sentence_level;

    let mut edges: Vec<Edge> = Vec::new();

    // Structural containment: conversation -> message.
    let messages = sqlx::query(&format!(
        "SELECT entity_id, parent_id, role, session_id, content_date, timestamp_utc, message_index FROM {} WHERE run_id = ? ORDER BY session_id, timestamp_utc, message_index",
        ctx.table(7)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    for row in &messages {
        outcome.rows_in += 1;
        edges.push(Edge {
            source_id: row.try_get("parent_id")?,
            target_id: row.try_get("entity_id")?,
            rel_type: rel::PARENT_CHILD,
            source_level: Level::Conversation.as_i64(),
            target_level: Level::Message.as_i64(),
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
        });
    }

    // message -> sentence.
    let sentences = sqlx::query(&format!(
        "SELECT entity_id, parent_id, session_id, content_date FROM {} WHERE run_id = ?",
        ctx.table(6)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    for row in &sentences {
        outcome.rows_in += 1;
        edges.push(Edge {
            source_id: row.try_get("parent_id")?,
            target_id: row.try_get("entity_id")?,
            rel_type: rel::PARENT_CHILD,
            source_level: Level::Message.as_i64(),
            target_level: sentence_level,
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
        });
    }

    // sentence (or message) -> span.
    let spans = sqlx::query(&format!(
        "SELECT entity_id, parent_id, session_id, content_date FROM {} WHERE run_id = ?",
        ctx.table(8)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let span_parent_level = if sentence_level == Level::Sentence.as_i64() {
        sentence_level
    } else {
        Level::Message.as_i64()
    };
    for row in &spans {
        outcome.rows_in += 1;
        edges.push(Edge {
            source_id: row.try_get("parent_id")?,
            target_id: row.try_get("entity_id")?,
            rel_type: rel::PARENT_CHILD,
            source_level: span_parent_level,
            target_level: Level::Span.as_i64(),
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
        });
    }

    // Sequential edges between adjacent messages of a session.
    let mut prev: Option<(String, String, Option<String>)> = None; // (entity, session, role)
    for row in &messages {
        let entity_id: String = row.try_get("entity_id")?;
        let session_id: String = row.try_get("session_id")?;
        let role: Option<String> = row.try_get("role")?;
        let content_date: Option<String> = row.try_get("content_date")?;

        if let Some((prev_entity, prev_session, prev_role)) = &prev {
            if *prev_session == session_id {
                if let Some(rel_type) = sequential_rel_type(prev_role.as_deref(), role.as_deref())
                {
                    edges.push(Edge {
                        source_id: prev_entity.clone(),
                        target_id: entity_id.clone(),
                        rel_type,
                        source_level: Level::Message.as_i64(),
                        target_level: Level::Message.as_i64(),
                        session_id: Some(session_id.clone()),
                        content_date,
                    });
                }
            }
        }
        prev = Some((entity_id, session_id, role));
    }

    if ctx.opts.dry_run {
        outcome.note(format!("dry-run: {} edges", edges.len()));
        return Ok(outcome);
    }

    let mut tx = ctx.pool.begin().await?;

    for edge in &edges {
        let id = relationship_id(&edge.source_id, &edge.target_id, edge.rel_type);
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (relationship_id, source_entity_id, target_entity_id, relationship_type,
             source_level, target_level, strength, confidence, session_id,
             content_date, created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&id)
        .bind(&edge.source_id)
        .bind(&edge.target_id)
        .bind(edge.rel_type)
        .bind(edge.source_level)
        .bind(edge.target_level)
        .bind(1.0f64)
        .bind(1.0f64)
        .bind(&edge.session_id)
        .bind(&edge.content_date)
        .bind(&created_at)
        .bind(&ctx.run_id)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, edges = outcome.rows_out, "relationship derivation complete");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::relationship_id;

    #[test]
    fn user_to_assistant_is_a_reply() {
        assert_eq!(
            sequential_rel_type(Some("user"), Some("assistant")),
            Some(rel::REPLIES_TO)
        );
    }

    #[test]
    fn assistant_to_user_continues() {
        assert_eq!(
            sequential_rel_type(Some("assistant"), Some("user")),
            Some(rel::CONTINUES)
        );
    }

    #[test]
    fn other_transitions_emit_nothing() {
        assert_eq!(sequential_rel_type(Some("user"), Some("user")), None);
        assert_eq!(sequential_rel_type(Some("assistant"), Some("assistant")), None);
        assert_eq!(sequential_rel_type(Some("tool"), Some("assistant")), None);
        assert_eq!(sequential_rel_type(Some("assistant"), Some("tool")), None);
        assert_eq!(sequential_rel_type(None, Some("user")), None);
        assert_eq!(sequential_rel_type(Some("system"), Some("user")), None);
    }

    #[test]
    fn edge_ids_are_stable_and_distinct_per_type() {
        let a = relationship_id("src", "tgt", rel::REPLIES_TO);
        let b = relationship_id("src", "tgt", rel::REPLIES_TO);
        let c = relationship_id("src", "tgt", rel::PARENT_CHILD);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
