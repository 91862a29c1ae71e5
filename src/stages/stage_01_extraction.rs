//! Stage 1: extraction.
//!
//! Streams every file named by the run's manifest, line by line. Lines
//! conforming to the message envelope become stage 1 rows; everything
//! else lands in the DLQ with a reason and its 1-based line offset. A
//! malformed line never aborts the stage; an unreadable file is fatal
//! for that file only (recorded as a signal).

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::identity;
use crate::models::VALID_ROLES;
use crate::provenance::record_signal;
use crate::tables;
use crate::textutil::{deserialize_datetime, now_utc, serialize_datetime};

use super::{stage_00_discovery, StageContext, StageOutcome};

#[derive(Debug, Clone)]
pub struct ExtractedRow {
    pub extraction_id: String,
    pub session_id: String,
    pub message_index: i64,
    pub message_type: String,
    pub role: Option<String>,
    pub content: Option<String>,
    pub model: Option<String>,
    pub cost_usd: Option<f64>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub source_file: String,
    pub content_date: Option<String>,
    pub timestamp_utc: Option<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct DlqRow {
    pub source_file: String,
    pub line_offset: i64,
    pub raw_line: String,
    pub error_reason: String,
}

enum Parsed {
    Message(Box<ExtractedRow>),
    Rejected(String),
}

/// Parse one line against the message envelope.
fn parse_line(
    line: &str,
    session_id: &str,
    message_index: i64,
    source_file: &str,
) -> Parsed {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Parsed::Rejected(format!("invalid_json: {}", e)),
    };

    if value.get("type").and_then(|t| t.as_str()) != Some("message") {
        return Parsed::Rejected("not_a_message".to_string());
    }

    let role = match value.get("role").and_then(|r| r.as_str()) {
        Some(r) if VALID_ROLES.contains(&r) => r.to_string(),
        Some(r) => return Parsed::Rejected(format!("invalid_role: {}", r)),
        None => return Parsed::Rejected("missing_role".to_string()),
    };

    let content = match value.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(v @ (Value::Array(_) | Value::Object(_))) => v.to_string(),
        Some(_) => return Parsed::Rejected("invalid_content".to_string()),
        None => return Parsed::Rejected("missing_content".to_string()),
    };

    let timestamp_utc = value
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(deserialize_datetime)
        .map(|dt| serialize_datetime(&dt));
    let content_date = timestamp_utc.as_ref().map(|t| t[..10].to_string());

    let fingerprint = identity::fingerprint(session_id, message_index, &content);
    let extraction_id = format!(
        "ext:{}:{}:{}",
        session_id,
        message_index,
        &fingerprint[..8]
    );

    Parsed::Message(Box::new(ExtractedRow {
        extraction_id,
        session_id: session_id.to_string(),
        message_index,
        message_type: "message".to_string(),
        role: Some(role),
        content: Some(content),
        model: value.get("model").and_then(|m| m.as_str()).map(String::from),
        cost_usd: value.get("cost_usd").and_then(|c| c.as_f64()),
        tool_name: value.get("tool_name").and_then(|t| t.as_str()).map(String::from),
        tool_input: value.get("tool_input").map(|v| v.to_string()),
        tool_output: value.get("tool_output").map(|v| v.to_string()),
        source_file: source_file.to_string(),
        content_date,
        timestamp_utc,
        fingerprint,
    }))
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let manifest = stage_00_discovery::load_manifest(ctx).await?;
    if !manifest.is_go() {
        bail!(
            "Discovery verdict is {} for run '{}'.\n  What this means: the source directory did not pass preflight, so extraction will not start.\n  What to do: inspect the manifest, fix the source files, and re-run `loom discover`.",
            manifest.go_no_go,
            ctx.run_id,
        );
    }

    let mut outcome = StageOutcome::new(1);
    let extracted_at = now_utc();
    let table = ctx.table(1)?;
    let dlq = tables::dlq_table(ctx.source())?;

    let mut rows: Vec<ExtractedRow> = Vec::new();
    let mut dlq_rows: Vec<DlqRow> = Vec::new();

    for file in &manifest.files {
        let session_id = identity::session_id_from_path(&file.path);
        let handle = match File::open(&file.path) {
            Ok(h) => h,
            Err(e) => {
                warn!(file = %file.path, error = %e, "unreadable session file");
                record_signal(
                    ctx.pool,
                    1,
                    &ctx.run_id,
                    None,
                    "unreadable_file",
                    &format!("{}: {}", file.path, e),
                )
                .await?;
                continue;
            }
        };

        let reader = BufReader::new(handle);
        let mut message_index = 0i64;

        for (line_number, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    record_signal(
                        ctx.pool,
                        1,
                        &ctx.run_id,
                        None,
                        "unreadable_line",
                        &format!("{}:{}: {}", file.path, line_number + 1, e),
                    )
                    .await?;
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            outcome.rows_in += 1;

            match parse_line(&line, &session_id, message_index, &file.path) {
                Parsed::Message(row) => {
                    rows.push(*row);
                    message_index += 1;
                }
                Parsed::Rejected(reason) => {
                    dlq_rows.push(DlqRow {
                        source_file: file.path.clone(),
                        line_offset: (line_number + 1) as i64,
                        raw_line: line,
                        error_reason: reason,
                    });
                }
            }

            if rows.len() >= ctx.batch_size() {
                outcome.rows_out += flush_rows(ctx, &table, &rows, &extracted_at).await?;
                rows.clear();
            }
        }
    }

    if ctx.opts.dry_run {
        outcome.rows_out += rows.len() as u64;
        outcome.note(format!(
            "dry-run: would write {} rows, {} DLQ rows",
            outcome.rows_out,
            dlq_rows.len()
        ));
        return Ok(outcome);
    }

    if !rows.is_empty() {
        outcome.rows_out += flush_rows(ctx, &table, &rows, &extracted_at).await?;
    }
    outcome.skipped = flush_dlq(ctx.pool, &dlq, &dlq_rows, &ctx.run_id, &extracted_at).await?;

    info!(
        run_id = %ctx.run_id,
        extracted = outcome.rows_out,
        dlq = outcome.skipped,
        "extraction complete"
    );
    Ok(outcome)
}

async fn flush_rows(
    ctx: &StageContext<'_>,
    table: &str,
    rows: &[ExtractedRow],
    extracted_at: &str,
) -> Result<u64> {
    if ctx.opts.dry_run {
        return Ok(rows.len() as u64);
    }

    let mut tx = ctx.pool.begin().await?;
    let mut written = 0u64;

    for row in rows {
        let valid_time = row.timestamp_utc.as_deref().unwrap_or(extracted_at);
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (extraction_id, session_id, message_index, message_type, role, content,
             model, cost_usd, tool_name, tool_input, tool_output, source_file,
             content_date, timestamp_utc, fingerprint, extracted_at, run_id,
             valid_time, system_time, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
            table
        ))
        .bind(&row.extraction_id)
        .bind(&row.session_id)
        .bind(row.message_index)
        .bind(&row.message_type)
        .bind(&row.role)
        .bind(&row.content)
        .bind(&row.model)
        .bind(row.cost_usd)
        .bind(&row.tool_name)
        .bind(&row.tool_input)
        .bind(&row.tool_output)
        .bind(&row.source_file)
        .bind(&row.content_date)
        .bind(&row.timestamp_utc)
        .bind(&row.fingerprint)
        .bind(extracted_at)
        .bind(&ctx.run_id)
        .bind(valid_time)
        .bind(extracted_at)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected();
    }

    tx.commit().await?;
    Ok(written)
}

async fn flush_dlq(
    pool: &SqlitePool,
    dlq: &str,
    rows: &[DlqRow],
    run_id: &str,
    created_at: &str,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut written = 0u64;

    for row in rows {
        let dlq_id = identity::message_id_from_guid(
            &row.source_file,
            &format!("dlq:{}", row.line_offset),
            run_id,
        );
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {}
            (dlq_id, source_file, line_offset, raw_line, error_reason, run_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            dlq
        ))
        .bind(dlq_id)
        .bind(&row.source_file)
        .bind(row.line_offset)
        .bind(&row.raw_line)
        .bind(&row.error_reason)
        .bind(run_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected();
    }

    tx.commit().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_message() {
        let line = r#"{"type":"message","role":"user","content":"Hello","timestamp":"2024-01-01T00:00:00Z"}"#;
        match parse_line(line, "sess", 0, "f.jsonl") {
            Parsed::Message(row) => {
                assert_eq!(row.role.as_deref(), Some("user"));
                assert_eq!(row.content.as_deref(), Some("Hello"));
                assert_eq!(row.timestamp_utc.as_deref(), Some("2024-01-01T00:00:00Z"));
                assert_eq!(row.content_date.as_deref(), Some("2024-01-01"));
                assert_eq!(row.fingerprint.len(), 32);
            }
            Parsed::Rejected(reason) => panic!("rejected: {}", reason),
        }
    }

    #[test]
    fn list_content_is_serialized() {
        let line = r#"{"type":"message","role":"assistant","content":[{"type":"text","text":"hi"}]}"#;
        match parse_line(line, "sess", 0, "f.jsonl") {
            Parsed::Message(row) => {
                assert!(row.content.unwrap().starts_with('['));
            }
            Parsed::Rejected(reason) => panic!("rejected: {}", reason),
        }
    }

    #[test]
    fn rejects_bad_json() {
        match parse_line("{not json", "sess", 0, "f.jsonl") {
            Parsed::Rejected(reason) => assert!(reason.starts_with("invalid_json")),
            Parsed::Message(_) => panic!("should have been rejected"),
        }
    }

    #[test]
    fn rejects_non_message_types() {
        match parse_line(r#"{"type":"summary","title":"x"}"#, "sess", 0, "f.jsonl") {
            Parsed::Rejected(reason) => assert_eq!(reason, "not_a_message"),
            Parsed::Message(_) => panic!("should have been rejected"),
        }
    }

    #[test]
    fn rejects_unknown_role() {
        let line = r#"{"type":"message","role":"narrator","content":"x"}"#;
        match parse_line(line, "sess", 0, "f.jsonl") {
            Parsed::Rejected(reason) => assert!(reason.starts_with("invalid_role")),
            Parsed::Message(_) => panic!("should have been rejected"),
        }
    }

    #[test]
    fn fingerprint_is_stable_across_reextraction() {
        let line = r#"{"type":"message","role":"user","content":"same content"}"#;
        let fp1 = match parse_line(line, "sess", 3, "f.jsonl") {
            Parsed::Message(row) => row.fingerprint.clone(),
            _ => panic!(),
        };
        let fp2 = match parse_line(line, "sess", 3, "f.jsonl") {
            Parsed::Message(row) => row.fingerprint.clone(),
            _ => panic!(),
        };
        assert_eq!(fp1, fp2);
    }
}
