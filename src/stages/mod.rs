//! The 17 pipeline stages.
//!
//! Each stage is a free async function over a [`StageContext`]: it
//! validates that its upstream table has rows for the run, transforms
//! them in batches, and appends to its own table with `INSERT OR IGNORE`
//! so re-runs of the same `run_id` are no-ops. Collaborators (warehouse
//! pool, event writer, provenance writer) are injected through the
//! context; stages hold no globals.

pub mod stage_00_discovery;
pub mod stage_01_extraction;
pub mod stage_02_cleaning;
pub mod stage_03_identity;
pub mod stage_04_correction;
pub mod stage_05_conversations;
pub mod stage_06_sentences;
pub mod stage_07_messages;
pub mod stage_08_spans;
pub mod stage_09_embeddings;
pub mod stage_10_llm;
pub mod stage_11_sentiment;
pub mod stage_12_keywords;
pub mod stage_13_relationships;
pub mod stage_14_aggregation;
pub mod stage_15_validation;
pub mod stage_16_promotion;

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::events::EventWriter;
use crate::provenance::ProvenanceWriter;
use crate::tables;

/// Per-invocation stage options from the CLI.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub batch_size: Option<usize>,
    pub dry_run: bool,
    /// Stage 15: promote warnings to errors.
    pub strict: bool,
    /// Stage 16: also promote WARNING rows.
    pub include_warnings: bool,
}

/// Everything a stage needs, injected at the runner boundary.
pub struct StageContext<'a> {
    pub pool: &'a SqlitePool,
    pub config: &'a Config,
    pub run_id: String,
    pub opts: StageOptions,
    pub events: EventWriter,
    pub provenance: ProvenanceWriter,
}

impl<'a> StageContext<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        config: &'a Config,
        run_id: String,
        opts: StageOptions,
    ) -> Self {
        let lineage = config.lineage.enabled;
        Self {
            pool,
            config,
            run_id,
            opts,
            events: EventWriter::new(lineage),
            provenance: ProvenanceWriter::new(lineage),
        }
    }

    pub fn source(&self) -> &str {
        &self.config.source.name
    }

    pub fn pipeline(&self) -> String {
        self.config.source.pipeline_name()
    }

    pub fn batch_size(&self) -> usize {
        self.opts.batch_size.unwrap_or(self.config.pipeline.batch_size)
    }

    pub fn table(&self, stage: i64) -> Result<String> {
        tables::stage_table(self.source(), stage)
    }
}

/// What a stage did, for CLI reporting.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub stage: i64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub skipped: u64,
    pub notes: Vec<String>,
}

impl StageOutcome {
    pub fn new(stage: i64) -> Self {
        Self {
            stage,
            ..Default::default()
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Guard a stage's input: the upstream table must exist and carry rows
/// for this run. The failure names the table and the stage to re-run.
pub async fn ensure_input_rows(ctx: &StageContext<'_>, input_stage: i64) -> Result<u64> {
    let table = ctx.table(input_stage)?;

    if !table_exists(ctx.pool, &table).await? {
        bail!(
            "Input table '{}' does not exist.\n  What this means: stage {} ({}) has not produced output yet.\n  What to do: run `loom run {}` (or `loom init` if the database is new), then retry.",
            table,
            input_stage,
            tables::stage_description(input_stage),
            input_stage,
        );
    }

    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE run_id = ?",
        table
    ))
    .bind(&ctx.run_id)
    .fetch_one(ctx.pool)
    .await?;

    if count == 0 {
        bail!(
            "Input table '{}' has no rows for run '{}'.\n  What this means: stage {} ({}) did not run for this run id, or its output was rolled back.\n  What to do: run `loom run {} --run-id {}`, then retry.",
            table,
            ctx.run_id,
            input_stage,
            tables::stage_description(input_stage),
            input_stage,
            ctx.run_id,
        );
    }

    Ok(count as u64)
}

/// Dispatch a stage by number. Stage 0 is driven by `loom discover` and
/// is not reachable from here.
pub async fn run_stage(ctx: &StageContext<'_>, stage: i64) -> Result<StageOutcome> {
    tables::validate_stage(stage)?;
    match stage {
        0 => bail!("Stage 0 is driven by `loom discover`, not `loom run 0`"),
        1 => stage_01_extraction::run(ctx).await,
        2 => stage_02_cleaning::run(ctx).await,
        3 => stage_03_identity::run(ctx).await,
        4 => stage_04_correction::run(ctx).await,
        5 => stage_05_conversations::run(ctx).await,
        6 => stage_06_sentences::run(ctx).await,
        7 => stage_07_messages::run(ctx).await,
        8 => stage_08_spans::run(ctx).await,
        9 => stage_09_embeddings::run(ctx).await,
        10 => stage_10_llm::run(ctx).await,
        11 => stage_11_sentiment::run(ctx).await,
        12 => stage_12_keywords::run(ctx).await,
        13 => stage_13_relationships::run(ctx).await,
        14 => stage_14_aggregation::run(ctx).await,
        15 => stage_15_validation::run(ctx).await,
        16 => stage_16_promotion::run(ctx).await,
        _ => unreachable!("validate_stage covers the range"),
    }
}
