//! Identifier validation for anything that reaches a SQL statement.
//!
//! Stage tables are addressed by name, and rollback/verify accept run ids
//! from the command line. Every such identifier is checked against a strict
//! character class before it is interpolated into SQL; all value predicates
//! (`run_id = ?`, `entity_id = ?`) are bound parameters, never interpolated.

use std::sync::OnceLock;

use anyhow::{bail, Result};
use regex::Regex;

const MAX_IDENTIFIER_LEN: usize = 128;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-\.]+$").unwrap())
}

/// True when `s` is non-empty, within length limits, and drawn entirely
/// from `[A-Za-z0-9_\-\.]`.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_IDENTIFIER_LEN && identifier_re().is_match(s)
}

/// Validate a run id supplied on the command line.
pub fn validate_run_id(run_id: &str) -> Result<&str> {
    let trimmed = run_id.trim();
    if trimmed.is_empty() {
        bail!("Run ID cannot be empty");
    }
    if !is_valid_identifier(trimmed) {
        bail!(
            "Run ID contains invalid characters (allowed: letters, digits, '_', '-', '.'): '{}'",
            trimmed
        );
    }
    Ok(trimmed)
}

/// Validate a table name before it is spliced into a statement.
pub fn validate_table_name(table: &str) -> Result<&str> {
    if !is_valid_identifier(table) {
        bail!(
            "Table name contains invalid characters (allowed: letters, digits, '_', '-', '.'): '{}'",
            table
        );
    }
    Ok(table)
}
