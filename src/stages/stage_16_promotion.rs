//! Stage 16: promotion.
//!
//! Copies validated rows into the canonical `entity_unified` table.
//! PASSED rows always qualify; WARNING rows only with
//! `--include-warnings`. An entity_id already present in the target is
//! skipped and counted, never an error: re-runs are expected.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::models::EntityRecord;
use crate::tables;
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub eligible_entities: u64,
    pub promoted_entities: u64,
    pub skipped_duplicates: u64,
    pub skipped_failed: u64,
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let report = promote(ctx).await?;

    let mut outcome = StageOutcome::new(16);
    outcome.rows_in = report.eligible_entities + report.skipped_failed;
    outcome.rows_out = report.promoted_entities;
    outcome.skipped = report.skipped_duplicates;
    outcome.note(format!(
        "eligible={} promoted={} skipped_duplicates={} skipped_failed={}",
        report.eligible_entities,
        report.promoted_entities,
        report.skipped_duplicates,
        report.skipped_failed
    ));
    Ok(outcome)
}

pub async fn promote(ctx: &StageContext<'_>) -> Result<PromotionReport> {
    ensure_input_rows(ctx, 15).await?;

    let promoted_at = now_utc();
    let input = ctx.table(15)?;
    let target = tables::ENTITY_UNIFIED;

    let status_filter = if ctx.opts.include_warnings {
        "validation_status IN ('PASSED', 'WARNING')"
    } else {
        "validation_status = 'PASSED'"
    };

    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE run_id = ?",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_one(ctx.pool)
    .await?;

    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? AND {} ORDER BY session_id, level DESC, message_index, sentence_index",
        input, status_filter
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut report = PromotionReport {
        eligible_entities: rows.len() as u64,
        skipped_failed: (total as u64).saturating_sub(rows.len() as u64),
        ..Default::default()
    };

    if ctx.opts.dry_run {
        return Ok(report);
    }

    // Duplicates are resolved against the whole table, not just this run.
    let existing: Vec<String> =
        sqlx::query_scalar(&format!("SELECT entity_id FROM {}", target))
            .fetch_all(ctx.pool)
            .await?;
    let existing: HashSet<String> = existing.into_iter().collect();

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        let record = EntityRecord::from_row(row)?;

        if existing.contains(&record.entity_id) {
            report.skipped_duplicates += 1;
            continue;
        }

        let validation_status: String = row.try_get("validation_status")?;
        let validation_score: f64 = row.try_get("validation_score")?;

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, parent_id, source_name, source_pipeline, level, text, role,
             message_type, message_index, sentence_index, word_count, char_count,
             model, cost_usd, tool_name, embedding, embedding_model, embedding_dimension,
             primary_emotion, primary_emotion_score, emotions_detected, intent, task_type,
             code_languages, complexity, has_code_block, keywords, top_keyword,
             keyword_count, child_count, total_word_count, session_id, content_date,
             timestamp_utc, fingerprint, created_at, validation_status, validation_score,
             promoted_at, run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            target
        ))
        .bind(&record.entity_id)
        .bind(&record.parent_id)
        .bind(&record.source_name)
        .bind(&record.source_pipeline)
        .bind(record.level)
        .bind(&record.text)
        .bind(&record.role)
        .bind(&record.message_type)
        .bind(record.message_index)
        .bind(record.sentence_index)
        .bind(record.word_count)
        .bind(record.char_count)
        .bind(&record.model)
        .bind(record.cost_usd)
        .bind(&record.tool_name)
        .bind(&record.embedding)
        .bind(&record.embedding_model)
        .bind(record.embedding_dimension)
        .bind(&record.primary_emotion)
        .bind(record.primary_emotion_score)
        .bind(&record.emotions_detected)
        .bind(&record.intent)
        .bind(&record.task_type)
        .bind(&record.code_languages)
        .bind(&record.complexity)
        .bind(record.has_code_block.map(|b| b as i64))
        .bind(&record.keywords)
        .bind(&record.top_keyword)
        .bind(record.keyword_count)
        .bind(record.child_count)
        .bind(record.total_word_count)
        .bind(&record.session_id)
        .bind(&record.content_date)
        .bind(&record.timestamp_utc)
        .bind(&record.fingerprint)
        .bind(&record.created_at)
        .bind(&validation_status)
        .bind(validation_score)
        .bind(&promoted_at)
        .bind(&record.run_id)
        .execute(&mut *tx)
        .await?;
        report.promoted_entities += result.rows_affected();
    }

    tx.commit().await?;

    info!(
        run_id = %ctx.run_id,
        promoted = report.promoted_entities,
        skipped_duplicates = report.skipped_duplicates,
        "promotion complete"
    );
    Ok(report)
}
