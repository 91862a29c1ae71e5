//! Append-only per-entity event log.
//!
//! Every entity mutation the pipeline performs is recorded as an event
//! with a back-pointer to the previous event for that entity, a causal
//! chain of the entity ids that produced it, and a content hash over the
//! event payload. Entity state at any point in time is reconstructed by
//! folding events in system-time order.

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};

use crate::canonical::content_hash;
use crate::identity;
use crate::tables;
use crate::textutil::now_utc;

pub const EVENT_CREATED: &str = "CREATED";
pub const EVENT_UPDATED: &str = "UPDATED";
pub const EVENT_CORRECTED: &str = "CORRECTED";
pub const EVENT_DELETED: &str = "DELETED";

#[derive(Debug, Clone)]
pub struct EntityEvent {
    pub event_id: String,
    pub entity_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub previous_event_id: Option<String>,
    pub causal_chain: Vec<String>,
    pub stage: i64,
    pub run_id: String,
    pub system_time: String,
}

/// Deterministic event id over (entity, type, stage, run). One logical
/// event per entity per stage per run; re-runs are no-ops.
pub fn event_id(entity_id: &str, event_type: &str, stage: i64, run_id: &str) -> String {
    identity::message_id_from_guid(
        entity_id,
        &format!("event:{}:{}", event_type, stage),
        run_id,
    )
}

pub struct EventWriter {
    enabled: bool,
}

impl EventWriter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Append an event for an entity. The previous event id is looked up
    /// so reconstructions can walk the chain backwards.
    pub async fn append(
        &self,
        pool: &SqlitePool,
        entity_id: &str,
        event_type: &str,
        event_data: Value,
        causal_chain: &[String],
        stage: i64,
        run_id: &str,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let previous: Option<String> = sqlx::query_scalar(&format!(
            "SELECT event_id FROM {} WHERE entity_id = ? ORDER BY system_time DESC, event_id DESC LIMIT 1",
            tables::EVENT_STORE
        ))
        .bind(entity_id)
        .fetch_optional(pool)
        .await?;

        let event = EntityEvent {
            event_id: event_id(entity_id, event_type, stage, run_id),
            entity_id: entity_id.to_string(),
            event_type: event_type.to_string(),
            event_data,
            previous_event_id: previous,
            causal_chain: causal_chain.to_vec(),
            stage,
            run_id: run_id.to_string(),
            system_time: now_utc(),
        };

        let hash = content_hash(&json!({
            "entity_id": &event.entity_id,
            "event_type": &event.event_type,
            "event_data": &event.event_data,
            "stage": event.stage,
            "run_id": &event.run_id,
        }));

        sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (event_id, entity_id, event_type, event_data, previous_event_id,
             causal_chain, stage, run_id, system_time, event_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            tables::EVENT_STORE
        ))
        .bind(&event.event_id)
        .bind(&event.entity_id)
        .bind(&event.event_type)
        .bind(event.event_data.to_string())
        .bind(&event.previous_event_id)
        .bind(serde_json::to_string(&event.causal_chain)?)
        .bind(event.stage)
        .bind(&event.run_id)
        .bind(&event.system_time)
        .bind(hash)
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Fold an entity's events up to `as_of` (inclusive; `None` = latest)
/// into its reconstructed state. Later events overwrite earlier fields.
pub async fn reconstruct_state(
    pool: &SqlitePool,
    entity_id: &str,
    as_of: Option<&str>,
) -> Result<Option<Value>> {
    let rows = match as_of {
        Some(cutoff) => {
            sqlx::query(&format!(
                "SELECT event_data FROM {} WHERE entity_id = ? AND system_time <= ? ORDER BY system_time ASC, event_id ASC",
                tables::EVENT_STORE
            ))
            .bind(entity_id)
            .bind(cutoff)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT event_data FROM {} WHERE entity_id = ? ORDER BY system_time ASC, event_id ASC",
                tables::EVENT_STORE
            ))
            .bind(entity_id)
            .fetch_all(pool)
            .await?
        }
    };

    if rows.is_empty() {
        return Ok(None);
    }

    let mut state = serde_json::Map::new();
    for row in rows {
        let data: String = row.try_get("event_data")?;
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(&data) {
            for (k, v) in fields {
                state.insert(k, v);
            }
        }
    }

    Ok(Some(Value::Object(state)))
}

/// Walk causal chains backwards from an entity, breadth-first, up to
/// `max_depth` hops. Returns the entity ids encountered (excluding the
/// starting entity), nearest first.
pub async fn causal_ancestry(
    pool: &SqlitePool,
    entity_id: &str,
    max_depth: usize,
) -> Result<Vec<String>> {
    let mut frontier = vec![entity_id.to_string()];
    let mut seen = std::collections::HashSet::new();
    seen.insert(entity_id.to_string());
    let mut ancestry = Vec::new();

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for id in frontier.drain(..) {
            let chains: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT causal_chain FROM {} WHERE entity_id = ?",
                tables::EVENT_STORE
            ))
            .bind(&id)
            .fetch_all(pool)
            .await?;

            for chain in chains {
                let ids: Vec<String> = serde_json::from_str(&chain).unwrap_or_default();
                for cause in ids {
                    if seen.insert(cause.clone()) {
                        ancestry.push(cause.clone());
                        next.push(cause);
                    }
                }
            }
        }
        frontier = next;
    }

    Ok(ancestry)
}
