//! Stage 15: validation.
//!
//! Scores every aggregated row and stamps it PASSED / WARNING / FAILED.
//! Hard checks (identity shape, level range, required fields) produce
//! errors; softer quality findings produce warnings. Failed rows are
//! written, not dropped, so they stay observable; promotion filters on
//! the verdict.

use anyhow::Result;
use tracing::info;

use crate::contracts::contract_for;
use crate::identity::is_canonical_entity_id;
use crate::models::{EntityRecord, VALID_LEVELS};
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

pub const STATUS_PASSED: &str = "PASSED";
pub const STATUS_WARNING: &str = "WARNING";
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: &'static str,
    pub score: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validate one entity. Score starts at 1.0 and loses 0.5 per error and
/// 0.1 per warning, clamped to [0, 1]. Strict mode promotes warnings to
/// errors before scoring.
pub fn validate_entity(
    record: &EntityRecord,
    strict: bool,
    contract_violations: &[String],
) -> Verdict {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // Identity shape is the gatekeeper for everything downstream.
    if record.entity_id.is_empty() {
        errors.push("entity_id is blank".to_string());
    } else if record.entity_id.len() != 32 {
        errors.push(format!(
            "entity_id has length {}, expected 32",
            record.entity_id.len()
        ));
    } else if !is_canonical_entity_id(&record.entity_id) {
        errors.push("entity_id is not lowercase hex".to_string());
    }

    if !VALID_LEVELS.contains(&record.level) {
        errors.push(format!(
            "level {} outside the valid set {:?}",
            record.level, VALID_LEVELS
        ));
    }

    if record.source_name.is_empty() {
        errors.push("source_name is empty".to_string());
    }
    if record.session_id.is_empty() {
        errors.push("session_id is empty".to_string());
    }

    // Text rules depend on the level: fine-grained entities must carry
    // text; an empty token is merely suspicious.
    if record.level <= 6 && record.text.is_none() {
        errors.push(format!("text is null at level {}", record.level));
    }
    if record.level == 2 && record.text.as_deref() == Some("") {
        warnings.push("empty text on L2 token".to_string());
    }

    if let Some(wc) = record.word_count {
        if wc < 0 {
            errors.push(format!("word_count is negative: {}", wc));
        }
    }

    for violation in contract_violations {
        warnings.push(format!("contract: {}", violation));
    }

    if strict {
        errors.append(&mut warnings);
    }

    let score = (1.0 - 0.5 * errors.len() as f64 - 0.1 * warnings.len() as f64).clamp(0.0, 1.0);

    let status = if !errors.is_empty() {
        STATUS_FAILED
    } else if score < 0.9 {
        STATUS_WARNING
    } else {
        STATUS_PASSED
    };

    Verdict {
        status,
        score,
        errors,
        warnings,
    }
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 14).await?;

    let mut outcome = StageOutcome::new(15);
    let validated_at = now_utc();
    let input = ctx.table(14)?;
    let output = ctx.table(15)?;

    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, level DESC, message_index, sentence_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut passed = 0u64;
    let mut warned = 0u64;
    let mut failed = 0u64;

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;
        let record = EntityRecord::from_row(row)?;

        let contract_violations = contract_for(ctx.config, 14)
            .map(|c| c.check_record(&record))
            .unwrap_or_default();
        let verdict = validate_entity(&record, ctx.opts.strict, &contract_violations);

        match verdict.status {
            STATUS_PASSED => passed += 1,
            STATUS_WARNING => warned += 1,
            _ => failed += 1,
        }

        if ctx.opts.dry_run {
            outcome.rows_out += 1;
            continue;
        }

        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (entity_id, parent_id, source_name, source_pipeline, level, text, role,
             message_type, message_index, sentence_index, word_count, char_count,
             model, cost_usd, tool_name, embedding, embedding_model, embedding_dimension,
             primary_emotion, primary_emotion_score, emotions_detected, intent, task_type,
             code_languages, complexity, has_code_block, keywords, top_keyword,
             keyword_count, child_count, total_word_count, session_id, content_date,
             timestamp_utc, fingerprint, created_at,
             validation_status, validation_score, validation_errors, validation_warnings,
             validated_at, run_id, valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            output
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
        .bind(verdict.status)
        .bind(verdict.score)
        .bind(serde_json::to_string(&verdict.errors)?)
        .bind(serde_json::to_string(&verdict.warnings)?)
        .bind(&validated_at)
        .bind(&record.run_id)
        .bind(record.timestamp_utc.as_deref().unwrap_or(&validated_at))
        .bind(&validated_at)
        .execute(&mut *tx)
        .await?;
        outcome.rows_out += result.rows_affected();
    }

    tx.commit().await?;

    outcome.note(format!(
        "passed={} warning={} failed={}",
        passed, warned, failed
    ));
    info!(run_id = %ctx.run_id, passed, warned, failed, "validation complete");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> EntityRecord {
        EntityRecord {
            entity_id: "0123456789abcdef0123456789abcdef".to_string(),
            source_name: "claude_code".to_string(),
            source_pipeline: "claude_code_ingest".to_string(),
            level: 5,
            text: Some("hello world".to_string()),
            word_count: Some(2),
            session_id: "abc".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            run_id: "run_1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn clean_record_passes_with_full_score() {
        let v = validate_entity(&valid_record(), false, &[]);
        assert_eq!(v.status, STATUS_PASSED);
        assert!((v.score - 1.0).abs() < 1e-9);
        assert!(v.errors.is_empty());
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn blank_entity_id_is_a_hard_error() {
        let mut r = valid_record();
        r.entity_id = String::new();
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
        assert!(!v.errors.is_empty());
        assert!(v.score <= 0.5);
    }

    #[test]
    fn wrong_length_entity_id_fails() {
        let mut r = valid_record();
        r.entity_id = "abc123".to_string();
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
    }

    #[test]
    fn uppercase_hex_fails() {
        let mut r = valid_record();
        r.entity_id = "0123456789ABCDEF0123456789ABCDEF".to_string();
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
    }

    #[test]
    fn invalid_level_fails() {
        let mut r = valid_record();
        r.level = 7;
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
        assert!(v.errors.iter().any(|e| e.contains("level")));
    }

    #[test]
    fn null_text_below_l6_fails() {
        let mut r = valid_record();
        r.text = None;
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
    }

    #[test]
    fn null_text_on_l8_is_fine() {
        let mut r = valid_record();
        r.level = 8;
        r.text = None;
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_PASSED);
    }

    #[test]
    fn empty_l2_text_is_a_warning() {
        let mut r = valid_record();
        r.level = 2;
        r.text = Some(String::new());
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_PASSED);
        assert_eq!(v.warnings.len(), 1);
        assert!((v.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn negative_word_count_fails() {
        let mut r = valid_record();
        r.word_count = Some(-5);
        let v = validate_entity(&r, false, &[]);
        assert_eq!(v.status, STATUS_FAILED);
    }

    #[test]
    fn two_warnings_drop_below_passing() {
        let r = valid_record();
        let violations = vec!["a".to_string(), "b".to_string()];
        let v = validate_entity(&r, false, &violations);
        assert_eq!(v.status, STATUS_WARNING);
        assert!((v.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn strict_promotes_warnings_to_errors() {
        let r = valid_record();
        let violations = vec!["a".to_string()];
        let v = validate_entity(&r, true, &violations);
        assert_eq!(v.status, STATUS_FAILED);
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn score_is_clamped() {
        let mut r = valid_record();
        r.entity_id = String::new();
        r.session_id = String::new();
        r.source_name = String::new();
        r.level = 0;
        r.text = None;
        let v = validate_entity(&r, false, &[]);
        assert!(v.score >= 0.0);
    }

    #[test]
    fn revalidation_is_deterministic() {
        let r = valid_record();
        let a = validate_entity(&r, false, &[]);
        let b = validate_entity(&r, false, &[]);
        assert_eq!(a.status, b.status);
        assert!((a.score - b.score).abs() < 1e-12);
    }
}
