//! Pipeline status overview.
//!
//! A quick read on warehouse health: per-stage row counts (optionally
//! scoped to a run), DLQ and signal volumes, the validation verdict
//! breakdown, and the canonical table total. Gives confidence that a
//! run landed where it should before anything is promoted or rolled
//! back.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::guard::validate_run_id;
use crate::stages::table_exists;
use crate::tables;

pub async fn run_status(config: &Config, run_id: Option<&str>) -> Result<()> {
    if let Some(r) = run_id {
        validate_run_id(r)?;
    }

    let pool = db::connect(config).await?;
    let source = &config.source.name;

    println!("corpus-loom — warehouse status");
    println!("==============================");
    println!();
    println!("  database: {}", config.db.path.display());
    let db_size = std::fs::metadata(&config.db.path).map(|m| m.len()).unwrap_or(0);
    println!("  size:     {}", format_bytes(db_size));
    if let Some(r) = run_id {
        println!("  run:      {}", r);
    }
    println!();

    println!("  stage  rows      description");
    for stage in tables::FIRST_STAGE..=tables::LAST_STAGE {
        let table = tables::stage_table(source, stage)?;
        let count = if table_exists(&pool, &table).await? {
            match run_id {
                Some(r) => {
                    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE run_id = ?", table))
                        .bind(r)
                        .fetch_one(&pool)
                        .await?
                }
                None => {
                    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
                        .fetch_one(&pool)
                        .await?
                }
            }
        } else {
            0
        };
        println!(
            "  {:>5}  {:>8}  {}",
            stage,
            count,
            tables::stage_description(stage)
        );
    }

    let dlq = tables::dlq_table(source)?;
    if table_exists(&pool, &dlq).await? {
        let dlq_count: i64 = match run_id {
            Some(r) => sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE run_id = ?", dlq))
                .bind(r)
                .fetch_one(&pool)
                .await?,
            None => sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", dlq))
                .fetch_one(&pool)
                .await?,
        };
        println!();
        println!("  DLQ rows:     {}", dlq_count);
    }

    if table_exists(&pool, tables::PIPELINE_SIGNALS).await? {
        let signal_count: i64 = match run_id {
            Some(r) => sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE run_id = ?",
                tables::PIPELINE_SIGNALS
            ))
            .bind(r)
            .fetch_one(&pool)
            .await?,
            None => sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {}",
                tables::PIPELINE_SIGNALS
            ))
            .fetch_one(&pool)
            .await?,
        };
        println!("  signals:      {}", signal_count);
    }

    // Validation verdicts for the latest (or requested) run.
    let validated = tables::stage_table(source, 15)?;
    if table_exists(&pool, &validated).await? {
        let rows = match run_id {
            Some(r) => sqlx::query(&format!(
                "SELECT validation_status AS s, COUNT(*) AS n FROM {} WHERE run_id = ? GROUP BY validation_status",
                validated
            ))
            .bind(r)
            .fetch_all(&pool)
            .await?,
            None => sqlx::query(&format!(
                "SELECT validation_status AS s, COUNT(*) AS n FROM {} GROUP BY validation_status",
                validated
            ))
            .fetch_all(&pool)
            .await?,
        };
        if !rows.is_empty() {
            println!();
            println!("  validation:");
            for row in rows {
                let status: String = row.try_get("s")?;
                let n: i64 = row.try_get("n")?;
                println!("    {:<8} {}", status, n);
            }
        }
    }

    if table_exists(&pool, tables::ENTITY_UNIFIED).await? {
        let unified: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            tables::ENTITY_UNIFIED
        ))
        .fetch_one(&pool)
        .await?;
        println!();
        println!("  entity_unified: {}", unified);
    }

    println!("ok");
    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
