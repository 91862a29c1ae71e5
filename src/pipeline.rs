//! Whole-pipeline orchestration.
//!
//! Runs stages in order for one run id, each under a wall-clock budget.
//! A timed-out or failed stage stops the run and leaves its partial
//! output in place; rollback by run id is the supported undo. Stages are
//! never interleaved for the same run.

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::stages::{self, StageContext, StageOptions, StageOutcome};
use crate::tables;

/// Run stages `from..=to` (stage 0 excluded; discovery is its own
/// command) against one run id.
pub async fn run_pipeline(
    config: &Config,
    run_id: &str,
    from: i64,
    to: i64,
    opts: StageOptions,
) -> Result<Vec<StageOutcome>> {
    tables::validate_stage(from)?;
    tables::validate_stage(to)?;
    if from > to {
        bail!("--from {} is after --to {}", from, to);
    }
    let from = from.max(1);

    let pool = db::connect(config).await?;
    let timeout = Duration::from_secs(config.pipeline.stage_timeout_secs);
    let mut outcomes = Vec::new();

    for stage in from..=to {
        let ctx = StageContext::new(&pool, config, run_id.to_string(), opts.clone());
        info!(stage, run_id, "stage starting");

        let outcome = match tokio::time::timeout(timeout, stages::run_stage(&ctx, stage)).await {
            Ok(result) => result?,
            Err(_) => {
                pool.close().await;
                bail!(
                    "Stage {} ({}) exceeded its {}s budget for run '{}'.\n  What this means: the stage was cancelled mid-write; its partial output is still in the table.\n  What to do: roll it back with `loom rollback {} --run-id {} --confirm`, then re-run it.",
                    stage,
                    tables::stage_description(stage),
                    timeout.as_secs(),
                    run_id,
                    stage,
                    run_id,
                );
            }
        };

        print_outcome(&outcome);
        outcomes.push(outcome);
    }

    pool.close().await;
    Ok(outcomes)
}

pub fn print_outcome(outcome: &StageOutcome) {
    println!(
        "stage {:>2}  in={:<7} out={:<7} skipped={:<5} {}",
        outcome.stage,
        outcome.rows_in,
        outcome.rows_out,
        outcome.skipped,
        tables::stage_description(outcome.stage)
    );
    for note in &outcome.notes {
        println!("          {}", note);
    }
}
