//! Per-stage rollback.
//!
//! Deleting by `run_id` is the canonical way to undo a stage: tables are
//! append-only, so removing a run's rows restores the previous state
//! exactly. The command refuses to run without an explicit run id,
//! previews the row count, and requires a literal `yes` unless
//! `--confirm` was passed. Identifiers are validated before they touch
//! SQL; the run id predicate is always a bound parameter.

use std::io::Write;

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::guard::{validate_run_id, validate_table_name};
use crate::tables;

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub row_count: i64,
    pub last_created_at: Option<String>,
}

/// Candidate run ids in a stage table, most recent first.
pub async fn list_runs(config: &Config, stage: i64) -> Result<Vec<RunSummary>> {
    let pool = db::connect(config).await?;
    let runs = list_runs_with_pool(&pool, config, stage).await;
    pool.close().await;
    runs
}

pub async fn list_runs_with_pool(
    pool: &SqlitePool,
    config: &Config,
    stage: i64,
) -> Result<Vec<RunSummary>> {
    let table = tables::stage_table(&config.source.name, stage)?;
    validate_table_name(&table)?;

    if !crate::stages::table_exists(pool, &table).await? {
        return Ok(Vec::new());
    }

    let created_col = if stage == 16 { "promoted_at" } else { "created_at" };
    // Stage 0/1 tables track their own write timestamps.
    let created_col = match stage {
        1 => "extracted_at",
        2 => "cleaned_at",
        3 => "identity_created_at",
        4 => "corrected_at",
        _ => created_col,
    };

    let rows = sqlx::query(&format!(
        "SELECT run_id, COUNT(*) AS n, MAX({}) AS last_at FROM {} GROUP BY run_id ORDER BY last_at DESC",
        created_col, table
    ))
    .fetch_all(pool)
    .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        runs.push(RunSummary {
            run_id: row.try_get("run_id")?,
            row_count: row.try_get("n")?,
            last_created_at: row.try_get("last_at")?,
        });
    }
    Ok(runs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Rows were deleted.
    Deleted(u64),
    /// Nothing to delete (missing table or no rows for the run).
    Nothing,
    /// User declined the confirmation prompt.
    Declined,
}

/// Roll back one stage for one run. `confirm` skips the interactive
/// prompt; without it the caller must type `yes`.
pub async fn rollback_stage(
    config: &Config,
    stage: i64,
    run_id: &str,
    confirm: bool,
) -> Result<RollbackOutcome> {
    let pool = db::connect(config).await?;
    let outcome = rollback_with_pool(&pool, config, stage, run_id, confirm).await;
    pool.close().await;
    outcome
}

pub async fn rollback_with_pool(
    pool: &SqlitePool,
    config: &Config,
    stage: i64,
    run_id: &str,
    confirm: bool,
) -> Result<RollbackOutcome> {
    tables::validate_stage(stage)?;
    let run_id = validate_run_id(run_id)?;
    let table = tables::stage_table(&config.source.name, stage)?;
    validate_table_name(&table)?;

    println!("rollback stage {} — {}", stage, tables::stage_description(stage));
    println!("  table: {}", table);
    println!("  run:   {}", run_id);

    if !crate::stages::table_exists(pool, &table).await? {
        println!("  table does not exist — nothing to roll back");
        return Ok(RollbackOutcome::Nothing);
    }

    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE run_id = ?",
        table
    ))
    .bind(run_id)
    .fetch_one(pool)
    .await?;

    if count == 0 {
        println!("  no rows for this run — nothing to roll back");
        return Ok(RollbackOutcome::Nothing);
    }

    println!("  {} rows will be deleted", count);

    if !confirm {
        print!("  type 'yes' to proceed: ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("  aborted");
            return Ok(RollbackOutcome::Declined);
        }
    }

    let mut deleted = sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", table))
        .bind(run_id)
        .execute(pool)
        .await?
        .rows_affected();

    // Stage 1 owns its dead-letter side table too.
    if stage == 1 {
        let dlq = tables::dlq_table(&config.source.name)?;
        if crate::stages::table_exists(pool, &dlq).await? {
            deleted += sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", dlq))
                .bind(run_id)
                .execute(pool)
                .await?
                .rows_affected();
        }
    }

    println!("  deleted {} rows", deleted);
    println!("ok");
    Ok(RollbackOutcome::Deleted(deleted))
}

/// Render `--list-runs` output.
pub fn print_runs(stage: i64, runs: &[RunSummary]) {
    println!("runs in stage {} — {}", stage, tables::stage_description(stage));
    if runs.is_empty() {
        println!("  (none)");
        return;
    }
    for run in runs {
        println!(
            "  {}  rows={}  last={}",
            run.run_id,
            run.row_count,
            run.last_created_at.as_deref().unwrap_or("-")
        );
    }
}
