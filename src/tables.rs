//! Stage table addressing.
//!
//! Every stage writes exactly one table, named `<source>_stage_<n>`
//! (stage 16 writes the canonical `entity_unified`). The lineage layer
//! adds fixed-name side tables. All names pass the identifier guard
//! before they are used in SQL.

use anyhow::Result;

use crate::guard::validate_table_name;

pub const ENTITY_UNIFIED: &str = "entity_unified";
pub const EVENT_STORE: &str = "event_store";
pub const PROVENANCE_LEDGER: &str = "provenance_ledger";
pub const DATA_CONTRACTS: &str = "data_contracts";
pub const PIPELINE_SIGNALS: &str = "pipeline_signals";

pub const FIRST_STAGE: i64 = 0;
pub const LAST_STAGE: i64 = 16;

/// Output table for a stage. Stage 16's output is `entity_unified`.
pub fn stage_table(source: &str, stage: i64) -> Result<String> {
    validate_stage(stage)?;
    let name = if stage == 16 {
        ENTITY_UNIFIED.to_string()
    } else {
        format!("{}_stage_{}", source, stage)
    };
    validate_table_name(&name)?;
    Ok(name)
}

/// Dead-letter table for extraction (stage 1).
pub fn dlq_table(source: &str) -> Result<String> {
    let name = format!("{}_stage_1_dlq", source);
    validate_table_name(&name)?;
    Ok(name)
}

pub fn validate_stage(stage: i64) -> Result<i64> {
    if !(FIRST_STAGE..=LAST_STAGE).contains(&stage) {
        anyhow::bail!("Stage must be 0-16, got {}", stage);
    }
    Ok(stage)
}

/// Human-readable responsibility of each stage, used in CLI output and
/// in the "what to do" half of error messages.
pub fn stage_description(stage: i64) -> &'static str {
    match stage {
        0 => "Discovery (session file manifest)",
        1 => "Extraction (raw messages + DLQ)",
        2 => "Cleaning (text normalization, duplicates)",
        3 => "The Gate (identity assignment)",
        4 => "Text correction (unicode repair)",
        5 => "L8 conversations",
        6 => "Sentence detection",
        7 => "L5 messages (canonical form)",
        8 => "L3 spans",
        9 => "Embeddings",
        10 => "LLM extractions",
        11 => "Sentiment",
        12 => "Topics / keywords",
        13 => "Relationships",
        14 => "Aggregation",
        15 => "Validation",
        16 => "Promotion (entity_unified)",
        _ => "Unknown stage",
    }
}

/// The stage whose output feeds stage `n`; used to name what to re-run
/// when an input table is missing or empty.
pub fn upstream_stage(stage: i64) -> Option<i64> {
    match stage {
        0 => None,
        1 => Some(0),
        2 => Some(1),
        3 => Some(2),
        4 => Some(3),
        5..=7 => Some(4),
        8 => Some(6),
        9..=12 => Some(7),
        13 => Some(7),
        14 => Some(7),
        15 => Some(14),
        16 => Some(15),
        _ => None,
    }
}
