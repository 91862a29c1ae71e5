//! # Corpus Loom CLI (`loom`)
//!
//! The `loom` binary drives the ingestion pipeline: schema creation,
//! discovery, stage execution, verification, rollback, and status.
//!
//! ## Usage
//!
//! ```bash
//! loom --config ./config/loom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `loom init` | Create the SQLite warehouse and register data contracts |
//! | `loom discover` | Stage 0: scan session files, write the run manifest |
//! | `loom run <stage>` | Execute one stage (1-16) for a run |
//! | `loom pipeline` | Execute stages in order with per-stage timeouts |
//! | `loom verify <stage>` | Check a stage's invariants; exit 0/1 |
//! | `loom rollback <stage>` | Delete a run's rows from a stage table |
//! | `loom status` | Per-stage row counts, DLQ/signal volumes, verdicts |
//!
//! ## Examples
//!
//! ```bash
//! loom init
//! loom discover                       # prints the new run id and verdict
//! loom pipeline --run-id run_20240601120000_ab12cd34
//! loom verify 16 --run-id run_20240601120000_ab12cd34
//! loom rollback 16 --run-id run_20240601120000_ab12cd34 --confirm
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use corpus_loom::config;
use corpus_loom::db;
use corpus_loom::guard;
use corpus_loom::identity;
use corpus_loom::migrate;
use corpus_loom::pipeline;
use corpus_loom::rollback;
use corpus_loom::stages::{self, stage_00_discovery, StageContext, StageOptions};
use corpus_loom::status;
use corpus_loom::tables;
use corpus_loom::verify;

/// Corpus Loom — a staged ingestion pipeline from raw session logs to a
/// typed, append-only entity warehouse.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/loom.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "loom",
    about = "Corpus Loom — staged session ingestion into an entity warehouse",
    version,
    long_about = "Corpus Loom ingests raw AI session logs through a 17-stage pipeline: \
    discovery, extraction with a dead-letter queue, cleaning, identity assignment, text \
    repair, hierarchical entity derivation (conversations, messages, sentences, spans), \
    enrichment (embeddings, LLM extraction, sentiment, keywords), relationship edges, \
    rollups, validation, and promotion into the canonical entity_unified table. Every \
    stage is idempotent per run id, independently verifiable, and rollback-able."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/loom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the warehouse schema.
    ///
    /// Creates every stage table, the DLQ, entity_unified, and the
    /// lineage side tables, and registers the built-in data contracts.
    /// Idempotent.
    Init,

    /// Stage 0: discover session files and write the run manifest.
    ///
    /// Scans the configured source directory, samples files for
    /// parseability, and records a GO / NO_GO verdict. Prints the run id
    /// used by the rest of the pipeline.
    Discover {
        /// Reuse an existing run id instead of minting a fresh one.
        #[arg(long)]
        run_id: Option<String>,

        /// Scan and report without writing the manifest.
        #[arg(long)]
        dry_run: bool,
    },

    /// Execute one pipeline stage (1-16) for a run.
    Run {
        /// Stage number, 1-16.
        stage: i64,

        /// Run id the stage operates on (from `loom discover`).
        #[arg(long)]
        run_id: String,

        /// Rows per insert batch (defaults to pipeline.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Compute and report without writing.
        #[arg(long)]
        dry_run: bool,

        /// Stage 15: treat warnings as errors.
        #[arg(long)]
        strict: bool,

        /// Stage 16: also promote WARNING rows.
        #[arg(long)]
        include_warnings: bool,
    },

    /// Execute stages in order for a run, with per-stage timeouts.
    Pipeline {
        /// Run id the stages operate on.
        #[arg(long)]
        run_id: String,

        /// First stage to run.
        #[arg(long, default_value_t = 1)]
        from: i64,

        /// Last stage to run.
        #[arg(long, default_value_t = 16)]
        to: i64,

        /// Rows per insert batch (defaults to pipeline.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stage 15: treat warnings as errors.
        #[arg(long)]
        strict: bool,

        /// Stage 16: also promote WARNING rows.
        #[arg(long)]
        include_warnings: bool,
    },

    /// Verify a stage's output. Exits 0 when every check passes.
    Verify {
        /// Stage number, 0-16.
        stage: i64,

        /// Scope row counts and invariants to one run.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Delete a run's rows from a stage table.
    ///
    /// Refuses to run without `--run-id`; previews the row count and
    /// asks for confirmation unless `--confirm` is given.
    Rollback {
        /// Stage number, 0-16.
        stage: i64,

        /// Run id whose rows are deleted.
        #[arg(long, required_unless_present = "list_runs")]
        run_id: Option<String>,

        /// Skip the interactive confirmation.
        #[arg(long)]
        confirm: bool,

        /// List candidate run ids by recency instead of deleting.
        #[arg(long)]
        list_runs: bool,
    },

    /// Show per-stage row counts, DLQ and signal volumes, and verdicts.
    Status {
        /// Scope counts to one run.
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Warehouse initialized successfully.");
        }

        Commands::Discover { run_id, dry_run } => {
            let run_id = match run_id {
                Some(r) => guard::validate_run_id(&r)?.to_string(),
                None => identity::new_run_id(),
            };
            let pool = db::connect(&cfg).await?;
            let opts = StageOptions {
                dry_run,
                ..Default::default()
            };
            let ctx = StageContext::new(&pool, &cfg, run_id, opts);
            let manifest = stage_00_discovery::run(&ctx).await?;
            pool.close().await;

            println!("discover");
            println!("  run:      {}", manifest.run_id);
            println!("  files:    {}", manifest.file_count);
            println!("  size:     {} bytes", manifest.total_size);
            println!("  messages: {} (sampled)", manifest.message_count);
            println!("  verdict:  {}", manifest.go_no_go);
            println!("{}", if manifest.is_go() { "ok" } else { "no-go" });
        }

        Commands::Run {
            stage,
            run_id,
            batch_size,
            dry_run,
            strict,
            include_warnings,
        } => {
            let run_id = guard::validate_run_id(&run_id)?.to_string();
            let pool = db::connect(&cfg).await?;
            let opts = StageOptions {
                batch_size,
                dry_run,
                strict,
                include_warnings,
            };
            let ctx = StageContext::new(&pool, &cfg, run_id, opts);
            let outcome = stages::run_stage(&ctx, stage).await?;
            pool.close().await;
            pipeline::print_outcome(&outcome);
            println!("ok");
        }

        Commands::Pipeline {
            run_id,
            from,
            to,
            batch_size,
            strict,
            include_warnings,
        } => {
            let run_id = guard::validate_run_id(&run_id)?.to_string();
            let opts = StageOptions {
                batch_size,
                dry_run: false,
                strict,
                include_warnings,
            };
            pipeline::run_pipeline(&cfg, &run_id, from, to, opts).await?;
            println!("ok");
        }

        Commands::Verify { stage, run_id } => {
            let report = verify::verify_stage(&cfg, stage, run_id.as_deref()).await?;
            verify::print_report(&report);
            if !report.passed() {
                std::process::exit(1);
            }
        }

        Commands::Rollback {
            stage,
            run_id,
            confirm,
            list_runs,
        } => {
            tables::validate_stage(stage)?;
            if list_runs {
                let runs = rollback::list_runs(&cfg, stage).await?;
                rollback::print_runs(stage, &runs);
            } else {
                // clap guarantees run_id is present when not listing.
                let run_id = run_id.expect("--run-id required");
                rollback::rollback_stage(&cfg, stage, &run_id, confirm).await?;
            }
        }

        Commands::Status { run_id } => {
            status::run_status(&cfg, run_id.as_deref()).await?;
        }
    }

    Ok(())
}
