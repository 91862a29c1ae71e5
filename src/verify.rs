//! Per-stage verification.
//!
//! `loom verify <stage> [--run-id R]` checks table existence, row counts
//! (scoped to the run when supplied), and the stage's invariants. Checks
//! are written so a non-specialist can act on a failure: every failed
//! check prints what it means and what to do, then the technical detail.
//! Exit code 0 = all checks passed, 1 otherwise.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::guard::validate_run_id;
use crate::identity::is_canonical_entity_id;
use crate::models::rel;
use crate::tables;

#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    /// Populated on failure: (what this means, what to do, technical detail).
    pub failure: Option<(String, String, String)>,
}

impl Check {
    fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            failure: None,
        }
    }

    fn fail(
        name: impl Into<String>,
        means: impl Into<String>,
        todo: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            failure: Some((means.into(), todo.into(), detail.into())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub stage: i64,
    pub run_id: Option<String>,
    pub row_count: i64,
    pub checks: Vec<Check>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

pub async fn verify_stage(
    config: &Config,
    stage: i64,
    run_id: Option<&str>,
) -> Result<VerifyReport> {
    tables::validate_stage(stage)?;
    if let Some(r) = run_id {
        validate_run_id(r)?;
    }

    let pool = db::connect(config).await?;
    let report = verify_stage_with_pool(&pool, config, stage, run_id).await;
    pool.close().await;
    report
}

pub async fn verify_stage_with_pool(
    pool: &SqlitePool,
    config: &Config,
    stage: i64,
    run_id: Option<&str>,
) -> Result<VerifyReport> {
    let source = &config.source.name;
    let table = tables::stage_table(source, stage)?;
    let mut checks = Vec::new();

    let exists: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(&table)
            .fetch_one(pool)
            .await?;

    if exists == 0 {
        checks.push(Check::fail(
            "table_exists",
            format!("The stage {} output table has never been created.", stage),
            "Run `loom init` to create the schema, then run the stage.",
            format!("table '{}' not found in sqlite_master", table),
        ));
        return Ok(VerifyReport {
            stage,
            run_id: run_id.map(String::from),
            row_count: 0,
            checks,
        });
    }
    checks.push(Check::pass("table_exists"));

    let row_count: i64 = match run_id {
        Some(r) => {
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE run_id = ?", table))
                .bind(r)
                .fetch_one(pool)
                .await?
        }
        None => sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?,
    };

    if let Some(r) = run_id {
        if row_count == 0 {
            checks.push(Check::fail(
                "rows_for_run",
                format!("Stage {} produced no rows for run '{}'.", stage, r),
                format!(
                    "Run `loom run {} --run-id {}` (stage 0: `loom discover`), then verify again.",
                    stage, r
                ),
                format!("SELECT COUNT(*) FROM {} WHERE run_id = '{}' returned 0", table, r),
            ));
        } else {
            checks.push(Check::pass("rows_for_run"));
        }
    }

    stage_invariants(pool, config, stage, &table, run_id, &mut checks).await?;

    Ok(VerifyReport {
        stage,
        run_id: run_id.map(String::from),
        row_count,
        checks,
    })
}

async fn stage_invariants(
    pool: &SqlitePool,
    config: &Config,
    stage: i64,
    table: &str,
    run_id: Option<&str>,
    checks: &mut Vec<Check>,
) -> Result<()> {
    match stage {
        0 => {
            if let Some(r) = run_id {
                let verdict: Option<String> = sqlx::query_scalar(&format!(
                    "SELECT go_no_go FROM {} WHERE run_id = ?",
                    table
                ))
                .bind(r)
                .fetch_optional(pool)
                .await?;
                match verdict {
                    Some(v) if v == "GO" || v.starts_with("NO_GO(") => {
                        checks.push(Check::pass("manifest_verdict_shape"));
                    }
                    Some(v) => checks.push(Check::fail(
                        "manifest_verdict_shape",
                        "The discovery verdict is not in the expected form.",
                        "Re-run `loom discover` for this run id.",
                        format!("go_no_go = '{}'", v),
                    )),
                    None => checks.push(Check::fail(
                        "manifest_exists",
                        "No manifest was recorded for this run.",
                        "Run `loom discover --run-id <run>` first.",
                        format!("no row in {} for run '{}'", table, r),
                    )),
                }
            }
        }
        1 => {
            let bad: i64 = scoped_count(
                pool,
                table,
                "fingerprint IS NULL OR fingerprint = ''",
                run_id,
            )
            .await?;
            push_zero_check(
                checks,
                bad,
                "fingerprints_present",
                "Extracted rows are missing their content fingerprints, so duplicate detection and identity generation cannot work.",
                "Roll back stage 1 for this run and re-run extraction.",
            );
        }
        2 => {
            let bad: i64 =
                scoped_count(pool, table, "word_count < 0 OR content_length < 0", run_id).await?;
            push_zero_check(
                checks,
                bad,
                "counts_non_negative",
                "Cleaning produced negative length or word counts.",
                "Roll back stage 2 for this run and re-run cleaning.",
            );
        }
        3 => {
            entity_id_checks(pool, table, run_id, checks).await?;
            uniqueness_check(pool, table, "entity_id", run_id, checks).await?;
        }
        5 => {
            let bad: i64 = scoped_count(pool, table, "level != 8", None).await?;
            push_zero_check(
                checks,
                bad,
                "level_is_8",
                "Conversation rows must universally carry level 8; some do not.",
                "Roll back stage 5 and re-run it; if the problem persists the table was written by foreign code.",
            );
        }
        6 => {
            let expected = config.pipeline.sentence_level;
            let bad: i64 =
                scoped_count(pool, table, &format!("level != {}", expected), run_id).await?;
            push_zero_check(
                checks,
                bad,
                "level_matches_contract",
                format!(
                    "The sentence stage contract for this adapter says level {}, but other levels are present.",
                    expected
                ),
                "Check pipeline.sentence_level in the config against the data contract, then re-run stage 6.",
            );
        }
        7 => {
            let bad: i64 = scoped_count(pool, table, "level != 5", None).await?;
            push_zero_check(
                checks,
                bad,
                "level_is_5",
                "Canonical message rows must universally carry level 5; some do not.",
                "Roll back stage 7 and re-run it.",
            );
            entity_id_checks(pool, table, run_id, checks).await?;
        }
        8 => {
            let bad: i64 = scoped_count(pool, table, "level != 3", None).await?;
            push_zero_check(
                checks,
                bad,
                "level_is_3",
                "Span rows must carry level 3; some do not.",
                "Roll back stage 8 and re-run it.",
            );
            let empty: i64 =
                scoped_count(pool, table, "text IS NULL OR TRIM(text) = ''", run_id).await?;
            push_zero_check(
                checks,
                empty,
                "no_blank_spans",
                "Whitespace-only spans should have been dropped during derivation.",
                "Roll back stage 8 for this run and re-run it.",
            );
        }
        9 => {
            let bad: i64 = scoped_count(pool, table, "embedding_dimension <= 0", run_id).await?;
            push_zero_check(
                checks,
                bad,
                "embedding_dimensions_positive",
                "Embedding rows carry a non-positive dimension.",
                "Check the embedding provider configuration (embedding.dims) and re-run stage 9.",
            );
        }
        13 => {
            let bad_types: i64 = scoped_count(
                pool,
                table,
                &format!(
                    "relationship_type NOT IN ('{}', '{}', '{}')",
                    rel::PARENT_CHILD,
                    rel::REPLIES_TO,
                    rel::CONTINUES
                ),
                run_id,
            )
            .await?;
            push_zero_check(
                checks,
                bad_types,
                "relationship_types_known",
                "Edges exist with a type the pipeline never emits.",
                "Roll back stage 13 for this run and re-run it.",
            );

            // Sequential edges must stay within one session.
            let source = &config.source.name;
            let messages = tables::stage_table(source, 7)?;
            let crossed: i64 = match run_id {
                Some(r) => sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM {rel} e
                     JOIN {msg} s ON s.entity_id = e.source_entity_id AND s.run_id = e.run_id
                     JOIN {msg} t ON t.entity_id = e.target_entity_id AND t.run_id = e.run_id
                     WHERE e.relationship_type IN ('{r1}', '{r2}')
                       AND s.session_id != t.session_id AND e.run_id = ?",
                    rel = table,
                    msg = messages,
                    r1 = rel::REPLIES_TO,
                    r2 = rel::CONTINUES,
                ))
                .bind(r)
                .fetch_one(pool)
                .await?,
                None => sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM {rel} e
                     JOIN {msg} s ON s.entity_id = e.source_entity_id AND s.run_id = e.run_id
                     JOIN {msg} t ON t.entity_id = e.target_entity_id AND t.run_id = e.run_id
                     WHERE e.relationship_type IN ('{r1}', '{r2}')
                       AND s.session_id != t.session_id",
                    rel = table,
                    msg = messages,
                    r1 = rel::REPLIES_TO,
                    r2 = rel::CONTINUES,
                ))
                .fetch_one(pool)
                .await?,
            };
            push_zero_check(
                checks,
                crossed,
                "sequential_edges_same_session",
                "Reply/continue edges connect messages from different sessions.",
                "Roll back stage 13 for this run and re-run it.",
            );
        }
        15 => {
            validation_status_check(pool, table, run_id, checks).await?;
            let bad_scores: i64 = scoped_count(
                pool,
                table,
                "validation_score < 0.0 OR validation_score > 1.0",
                run_id,
            )
            .await?;
            push_zero_check(
                checks,
                bad_scores,
                "scores_in_unit_interval",
                "Validation scores fall outside [0, 1].",
                "Roll back stage 15 for this run and re-run validation.",
            );
        }
        16 => {
            uniqueness_check(pool, table, "entity_id", None, checks).await?;
            validation_status_check(pool, table, run_id, checks).await?;

            // Hierarchy: a present parent must sit strictly higher.
            let bad_parents: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {t} c JOIN {t} p ON p.entity_id = c.parent_id
                 WHERE c.parent_id IS NOT NULL AND p.level <= c.level",
                t = table
            ))
            .fetch_one(pool)
            .await?;
            push_zero_check(
                checks,
                bad_parents,
                "parents_strictly_higher",
                "Promoted entities reference parents at the same or lower level, which breaks the hierarchy.",
                "Roll back stage 16 for the offending run and inspect the derivation stages.",
            );
        }
        _ => {}
    }

    Ok(())
}

async fn scoped_count(
    pool: &SqlitePool,
    table: &str,
    predicate: &str,
    run_id: Option<&str>,
) -> Result<i64> {
    let count: i64 = match run_id {
        Some(r) => sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE ({}) AND run_id = ?",
            table, predicate
        ))
        .bind(r)
        .fetch_one(pool)
        .await?,
        None => sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            table, predicate
        ))
        .fetch_one(pool)
        .await?,
    };
    Ok(count)
}

fn push_zero_check(
    checks: &mut Vec<Check>,
    violations: i64,
    name: impl Into<String>,
    means: impl Into<String>,
    todo: impl Into<String>,
) {
    let name = name.into();
    if violations == 0 {
        checks.push(Check::pass(name));
    } else {
        checks.push(Check::fail(
            name,
            means,
            todo,
            format!("{} violating rows", violations),
        ));
    }
}

async fn entity_id_checks(
    pool: &SqlitePool,
    table: &str,
    run_id: Option<&str>,
    checks: &mut Vec<Check>,
) -> Result<()> {
    let rows = match run_id {
        Some(r) => sqlx::query(&format!(
            "SELECT entity_id FROM {} WHERE run_id = ?",
            table
        ))
        .bind(r)
        .fetch_all(pool)
        .await?,
        None => sqlx::query(&format!("SELECT entity_id FROM {}", table))
            .fetch_all(pool)
            .await?,
    };

    let bad = rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>("entity_id").ok())
        .filter(|id| !is_canonical_entity_id(id))
        .count();

    push_zero_check(
        checks,
        bad as i64,
        "entity_ids_canonical",
        "Entity ids exist that are not 32-character lowercase hex, so they did not come from the identity generator.",
        "Roll back this stage for the run and re-run it so The Gate can mint proper identities.",
    );
    Ok(())
}

async fn uniqueness_check(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    run_id: Option<&str>,
    checks: &mut Vec<Check>,
) -> Result<()> {
    let (total, distinct): (i64, i64) = match run_id {
        Some(r) => {
            let row = sqlx::query(&format!(
                "SELECT COUNT({c}) AS total, COUNT(DISTINCT {c}) AS uniq FROM {t} WHERE run_id = ?",
                c = column,
                t = table
            ))
            .bind(r)
            .fetch_one(pool)
            .await?;
            (row.try_get("total")?, row.try_get("uniq")?)
        }
        None => {
            let row = sqlx::query(&format!(
                "SELECT COUNT({c}) AS total, COUNT(DISTINCT {c}) AS uniq FROM {t}",
                c = column,
                t = table
            ))
            .fetch_one(pool)
            .await?;
            (row.try_get("total")?, row.try_get("uniq")?)
        }
    };

    push_zero_check(
        checks,
        total - distinct,
        format!("{}_unique", column),
        "Duplicate identities exist where uniqueness is required.",
        "Roll back the stage for the offending run; duplicates indicate the stage ran against corrupted input.",
    );
    Ok(())
}

async fn validation_status_check(
    pool: &SqlitePool,
    table: &str,
    run_id: Option<&str>,
    checks: &mut Vec<Check>,
) -> Result<()> {
    let bad: i64 = scoped_count(
        pool,
        table,
        "validation_status IS NOT NULL AND validation_status NOT IN ('PASSED', 'WARNING', 'FAILED')",
        run_id,
    )
    .await?;
    push_zero_check(
        checks,
        bad,
        "validation_status_known",
        "Rows carry a validation status outside PASSED / WARNING / FAILED.",
        "Roll back stage 15 for this run and re-run validation.",
    );
    Ok(())
}

/// Render a report the way the CLI prints it.
pub fn print_report(report: &VerifyReport) {
    println!(
        "verify stage {} — {}",
        report.stage,
        tables::stage_description(report.stage)
    );
    if let Some(ref r) = report.run_id {
        println!("  run: {}", r);
    }
    println!("  rows: {}", report.row_count);

    for check in &report.checks {
        if check.passed {
            println!("  ok   {}", check.name);
        } else if let Some((means, todo, detail)) = &check.failure {
            println!("  FAIL {}", check.name);
            println!("       What this means: {}", means);
            println!("       What to do: {}", todo);
            println!("       Technical error: {}", detail);
        }
    }

    println!("{}", if report.passed() { "ok" } else { "failed" });
}
