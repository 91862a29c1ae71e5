//! Content-addressed provenance ledger.
//!
//! Each stage records, per entity, the hash of what it read, the hash of
//! what it wrote, and the named transformation between them, chained to
//! the parent provenance row from the upstream stage. The ledger is
//! append-only; hashes use canonical JSON so they are stable across runs.

use anyhow::Result;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::canonical::content_hash;
use crate::identity;
use crate::tables;
use crate::textutil::now_utc;

#[derive(Debug, Clone)]
pub struct ProvenanceEntry {
    pub provenance_id: String,
    pub entity_id: String,
    pub stage: i64,
    pub input_hash: String,
    pub output_hash: String,
    pub transformation: String,
    pub params: Value,
    pub parent_provenance_id: Option<String>,
    pub run_id: String,
}

/// Deterministic provenance id: one row per (entity, stage, run).
pub fn provenance_id(entity_id: &str, stage: i64, run_id: &str) -> String {
    identity::message_id_from_guid(entity_id, &format!("prov:{}", stage), run_id)
}

pub struct ProvenanceWriter {
    enabled: bool,
}

impl ProvenanceWriter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Record a transformation. `input` and `output` are the record
    /// payloads as seen before and after the stage; only their hashes
    /// are stored.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        pool: &SqlitePool,
        entity_id: &str,
        stage: i64,
        input: &Value,
        output: &Value,
        transformation: &str,
        params: Value,
        run_id: &str,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        // Chain to the most recent upstream entry for this entity.
        let parent: Option<String> = sqlx::query_scalar(&format!(
            "SELECT provenance_id FROM {} WHERE entity_id = ? AND stage < ? ORDER BY stage DESC LIMIT 1",
            tables::PROVENANCE_LEDGER
        ))
        .bind(entity_id)
        .bind(stage)
        .fetch_optional(pool)
        .await?;

        let entry = ProvenanceEntry {
            provenance_id: provenance_id(entity_id, stage, run_id),
            entity_id: entity_id.to_string(),
            stage,
            input_hash: content_hash(input),
            output_hash: content_hash(output),
            transformation: transformation.to_string(),
            params,
            parent_provenance_id: parent,
            run_id: run_id.to_string(),
        };

        sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (provenance_id, entity_id, stage, input_hash, output_hash,
             transformation, params, parent_provenance_id, run_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            tables::PROVENANCE_LEDGER
        ))
        .bind(&entry.provenance_id)
        .bind(&entry.entity_id)
        .bind(entry.stage)
        .bind(&entry.input_hash)
        .bind(&entry.output_hash)
        .bind(&entry.transformation)
        .bind(entry.params.to_string())
        .bind(&entry.parent_provenance_id)
        .bind(&entry.run_id)
        .bind(now_utc())
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Record a skip/failure signal. Stages call this when an external call
/// exhausts retries or a row cannot be processed; the stage then moves
/// on rather than failing the batch.
pub async fn record_signal(
    pool: &SqlitePool,
    stage: i64,
    run_id: &str,
    entity_id: Option<&str>,
    signal_type: &str,
    message: &str,
) -> Result<()> {
    let signal_id = identity::message_id_from_guid(
        entity_id.unwrap_or("-"),
        &format!("signal:{}:{}", stage, signal_type),
        run_id,
    );

    sqlx::query(&format!(
        r#"
        INSERT OR IGNORE INTO {}
        (signal_id, stage, run_id, entity_id, signal_type, message, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        tables::PIPELINE_SIGNALS
    ))
    .bind(signal_id)
    .bind(stage)
    .bind(run_id)
    .bind(entity_id)
    .bind(signal_type)
    .bind(message)
    .bind(now_utc())
    .execute(pool)
    .await?;

    Ok(())
}
