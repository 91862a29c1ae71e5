//! Stage 3: The Gate.
//!
//! Every message receives its canonical `entity_id` here, derived from
//! (session, extraction GUID, fingerprint) so re-extractions reproduce
//! the same identity. Ids are registered per run; a duplicate
//! registration is an integrity violation that rejects the batch. After
//! this stage an identity is stable for all downstream stages and for
//! `entity_unified`.

use anyhow::{bail, Result};
use serde_json::json;
use sqlx::Row;
use tracing::info;

use crate::identity::{self, IdentityRegistry, InMemoryRegistry};
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 2).await?;

    let mut outcome = StageOutcome::new(3);
    let identity_created_at = now_utc();
    let input = ctx.table(2)?;
    let output = ctx.table(3)?;

    // Deterministic assignment order.
    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut registry = InMemoryRegistry::new();
    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let session_id: String = row.try_get("session_id")?;
        let extraction_id: String = row.try_get("extraction_id")?;
        let fingerprint: String = row.try_get("fingerprint")?;

        let entity_id = identity::message_id_from_guid(&session_id, &extraction_id, &fingerprint);

        if !registry.register(&entity_id) {
            bail!(
                "Integrity violation: duplicate entity_id '{}' within run '{}' (extraction '{}').\n  What this means: two distinct input rows hashed to the same identity, so the batch cannot be trusted.\n  What to do: roll back stage 3 for this run and inspect the stage 2 rows for duplicated extractions.",
                entity_id,
                ctx.run_id,
                extraction_id,
            );
        }

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let timestamp_utc: Option<String> = row.try_get("timestamp_utc")?;
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, extraction_id, session_id, message_index, message_type, role,
             content, content_length, word_count, model, cost_usd, tool_name,
             source_file, content_date, timestamp_utc, fingerprint, is_duplicate,
             identity_created_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
        ))
        .bind(&entity_id)
        .bind(&extraction_id)
        .bind(&session_id)
        .bind(row.try_get::<i64, _>("message_index")?)
        .bind(row.try_get::<String, _>("message_type")?)
        .bind(row.try_get::<Option<String>, _>("role")?)
        .bind(row.try_get::<Option<String>, _>("content")?)
        .bind(row.try_get::<i64, _>("content_length")?)
        .bind(row.try_get::<i64, _>("word_count")?)
        .bind(row.try_get::<Option<String>, _>("model")?)
        .bind(row.try_get::<Option<f64>, _>("cost_usd")?)
        .bind(row.try_get::<Option<String>, _>("tool_name")?)
        .bind(row.try_get::<String, _>("source_file")?)
        .bind(row.try_get::<Option<String>, _>("content_date")?)
        .bind(&timestamp_utc)
        .bind(&fingerprint)
        .bind(row.try_get::<i64, _>("is_duplicate")?)
        .bind(&identity_created_at)
        .bind(&ctx.run_id)
        .bind(timestamp_utc.as_deref().unwrap_or(&identity_created_at))
        .bind(&identity_created_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    if !ctx.opts.dry_run {
        // The Gate is where entities are born: record creation events and
        // the first provenance link.
        for row in &rows {
            let session_id: String = row.try_get("session_id")?;
            let extraction_id: String = row.try_get("extraction_id")?;
            let fingerprint: String = row.try_get("fingerprint")?;
            let entity_id =
                identity::message_id_from_guid(&session_id, &extraction_id, &fingerprint);

            let payload = json!({
                "entity_id": &entity_id,
                "session_id": &session_id,
                "extraction_id": &extraction_id,
                "fingerprint": &fingerprint,
            });

            ctx.events
                .append(
                    ctx.pool,
                    &entity_id,
                    crate::events::EVENT_CREATED,
                    payload.clone(),
                    &[],
                    3,
                    &ctx.run_id,
                )
                .await?;

            ctx.provenance
                .record(
                    ctx.pool,
                    &entity_id,
                    3,
                    &json!({ "extraction_id": &extraction_id, "fingerprint": &fingerprint }),
                    &payload,
                    "assign_identity",
                    json!({ "scheme": "message_id_from_guid" }),
                    &ctx.run_id,
                )
                .await?;
        }
    }

    info!(
        run_id = %ctx.run_id,
        identities = registry.len(),
        "identity assignment complete"
    );
    Ok(outcome)
}
