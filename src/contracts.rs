//! Per-stage data contracts.
//!
//! A contract names the fields a stage's output must carry, the quality
//! rules each row must satisfy, and the semantic rules that hold across
//! tables. The built-in registry covers stages 1-16 and is persisted to
//! the `data_contracts` table at init so external consumers can read the
//! same rules the pipeline enforces.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::identity::is_canonical_entity_id;
use crate::models::{EntityRecord, VALID_LEVELS};
use crate::tables;
use crate::textutil::now_utc;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompatibilityMode {
    Backward,
    BackwardCompatible,
    None,
}

impl CompatibilityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CompatibilityMode::Backward => "BACKWARD",
            CompatibilityMode::BackwardCompatible => "BACKWARD_COMPATIBLE",
            CompatibilityMode::None => "NONE",
        }
    }
}

/// A per-row predicate on a named field.
#[derive(Debug, Clone, Serialize)]
pub enum QualityRule {
    /// Field must be present and non-empty.
    NotNull(&'static str),
    /// `level` must equal exactly this value.
    LevelEquals(i64),
    /// `level` must be one of these values.
    LevelIn(Vec<i64>),
    /// `entity_id` must be canonical 32-char lowercase hex.
    CanonicalEntityId,
    /// Named count field, when present, must be >= 0.
    NonNegative(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageContract {
    pub stage: i64,
    pub schema_version: &'static str,
    pub required_fields: Vec<&'static str>,
    pub quality_rules: Vec<QualityRule>,
    /// Cross-table rules, stated for consumers; enforced by `verify`.
    pub semantic_rules: Vec<&'static str>,
    pub compatibility: CompatibilityMode,
}

impl StageContract {
    /// Evaluate the quality rules against a denormalized record.
    /// Returns human-readable violations.
    pub fn check_record(&self, record: &EntityRecord) -> Vec<String> {
        let mut violations = Vec::new();

        for rule in &self.quality_rules {
            match rule {
                QualityRule::NotNull(field) => {
                    let missing = match *field {
                        "entity_id" => record.entity_id.is_empty(),
                        "session_id" => record.session_id.is_empty(),
                        "source_name" => record.source_name.is_empty(),
                        "source_pipeline" => record.source_pipeline.is_empty(),
                        "text" => record.text.as_deref().map_or(true, str::is_empty),
                        "fingerprint" => {
                            record.fingerprint.as_deref().map_or(true, str::is_empty)
                        }
                        _ => false,
                    };
                    if missing {
                        violations.push(format!("{} must not be null or empty", field));
                    }
                }
                QualityRule::LevelEquals(expected) => {
                    if record.level != *expected {
                        violations
                            .push(format!("level must be {}, got {}", expected, record.level));
                    }
                }
                QualityRule::LevelIn(allowed) => {
                    if !allowed.contains(&record.level) {
                        violations.push(format!(
                            "level must be one of {:?}, got {}",
                            allowed, record.level
                        ));
                    }
                }
                QualityRule::CanonicalEntityId => {
                    if !is_canonical_entity_id(&record.entity_id) {
                        violations.push(format!(
                            "entity_id must be 32-char lowercase hex, got '{}'",
                            record.entity_id
                        ));
                    }
                }
                QualityRule::NonNegative(field) => {
                    let value = match *field {
                        "word_count" => record.word_count,
                        "char_count" => record.char_count,
                        "keyword_count" => record.keyword_count,
                        "child_count" => record.child_count,
                        _ => None,
                    };
                    if let Some(v) = value {
                        if v < 0 {
                            violations.push(format!("{} must be non-negative, got {}", field, v));
                        }
                    }
                }
            }
        }

        violations
    }
}

/// Contracts for every stage. The sentence stage's level comes from the
/// adapter configuration; callers must consult the contract rather than
/// assume L3 or L4.
pub fn builtin_contracts(config: &Config) -> Vec<StageContract> {
    let sentence_level = config.pipeline.sentence_level;

    vec![
        StageContract {
            stage: 1,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["extraction_id", "session_id", "message_index", "fingerprint"],
            quality_rules: vec![QualityRule::NotNull("session_id")],
            semantic_rules: vec!["non-conforming input lines route to the DLQ, never abort"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 3,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "extraction_id", "session_id", "fingerprint"],
            quality_rules: vec![QualityRule::CanonicalEntityId],
            semantic_rules: vec!["entity_id unique within a run_id"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 5,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "session_id", "message_count"],
            quality_rules: vec![QualityRule::CanonicalEntityId, QualityRule::LevelEquals(8)],
            semantic_rules: vec!["entity_id derives from the session hash, never the raw session_id"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 6,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "parent_id", "sentence_index", "text"],
            quality_rules: vec![
                QualityRule::CanonicalEntityId,
                QualityRule::LevelEquals(sentence_level),
                QualityRule::NotNull("text"),
            ],
            semantic_rules: vec!["parent_id must exist among L5 messages"],
            compatibility: CompatibilityMode::BackwardCompatible,
        },
        StageContract {
            stage: 7,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "parent_id", "message_index", "fingerprint"],
            quality_rules: vec![QualityRule::CanonicalEntityId, QualityRule::LevelEquals(5)],
            semantic_rules: vec!["parent_id must exist among L8 conversations"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 8,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "parent_id", "span_index", "text"],
            quality_rules: vec![
                QualityRule::CanonicalEntityId,
                QualityRule::LevelEquals(3),
                QualityRule::NotNull("text"),
            ],
            semantic_rules: vec!["whitespace-only spans are dropped"],
            compatibility: CompatibilityMode::BackwardCompatible,
        },
        StageContract {
            stage: 13,
            schema_version: SCHEMA_VERSION,
            required_fields: vec![
                "relationship_id",
                "source_entity_id",
                "target_entity_id",
                "relationship_type",
            ],
            quality_rules: vec![],
            semantic_rules: vec!["sequential edges connect messages of the same session only"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 14,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "level", "source_name", "session_id"],
            quality_rules: vec![
                QualityRule::CanonicalEntityId,
                QualityRule::LevelIn(VALID_LEVELS.to_vec()),
                QualityRule::NonNegative("word_count"),
                QualityRule::NonNegative("child_count"),
            ],
            semantic_rules: vec!["aggregation adds rollups, never new entities"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 15,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "validation_status", "validation_score"],
            quality_rules: vec![QualityRule::LevelIn(VALID_LEVELS.to_vec())],
            semantic_rules: vec!["validation_status in {PASSED, WARNING, FAILED}"],
            compatibility: CompatibilityMode::Backward,
        },
        StageContract {
            stage: 16,
            schema_version: SCHEMA_VERSION,
            required_fields: vec!["entity_id", "level", "source_name", "source_pipeline"],
            quality_rules: vec![
                QualityRule::CanonicalEntityId,
                QualityRule::LevelIn(VALID_LEVELS.to_vec()),
            ],
            semantic_rules: vec![
                "entity_id unique across the whole table",
                "parent_id, when present, references a higher-level entity",
            ],
            compatibility: CompatibilityMode::Backward,
        },
    ]
}

pub fn contract_for(config: &Config, stage: i64) -> Option<StageContract> {
    builtin_contracts(config).into_iter().find(|c| c.stage == stage)
}

/// Persist the built-in contracts. Idempotent per (stage, version).
pub async fn register_builtin_contracts(pool: &SqlitePool, config: &Config) -> Result<()> {
    for contract in builtin_contracts(config) {
        sqlx::query(&format!(
            r#"
            INSERT OR REPLACE INTO {}
            (stage, schema_version, required_fields, quality_rules,
             semantic_rules, compatibility_mode, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            tables::DATA_CONTRACTS
        ))
        .bind(contract.stage)
        .bind(contract.schema_version)
        .bind(serde_json::to_string(&contract.required_fields)?)
        .bind(serde_json::to_string(&contract.quality_rules)?)
        .bind(serde_json::to_string(&contract.semantic_rules)?)
        .bind(contract.compatibility.as_str())
        .bind(now_utc())
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let toml = r#"
            [db]
            path = "/tmp/loom-test.sqlite"
            [source]
            name = "claude_code"
            root = "/tmp"
        "#;
        toml::from_str(toml).unwrap()
    }

    fn passing_record(level: i64) -> EntityRecord {
        EntityRecord {
            entity_id: "a".repeat(32),
            source_name: "claude_code".into(),
            source_pipeline: "claude_code_ingest".into(),
            level,
            text: Some("hello".into()),
            word_count: Some(1),
            session_id: "abc123".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            run_id: "run_1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn stage_5_contract_requires_l8() {
        let config = test_config();
        let contract = contract_for(&config, 5).unwrap();
        assert!(contract.check_record(&passing_record(8)).is_empty());
        let violations = contract.check_record(&passing_record(5));
        assert!(violations.iter().any(|v| v.contains("level must be 8")));
    }

    #[test]
    fn stage_6_level_follows_config() {
        let config = test_config();
        let contract = contract_for(&config, 6).unwrap();
        assert!(contract.check_record(&passing_record(4)).is_empty());
        assert!(!contract.check_record(&passing_record(3)).is_empty());
    }

    #[test]
    fn canonical_id_rule_fires() {
        let config = test_config();
        let contract = contract_for(&config, 14).unwrap();
        let mut record = passing_record(5);
        record.entity_id = "short".into();
        let violations = contract.check_record(&record);
        assert!(violations.iter().any(|v| v.contains("32-char")));
    }

    #[test]
    fn negative_counts_flagged() {
        let config = test_config();
        let contract = contract_for(&config, 14).unwrap();
        let mut record = passing_record(5);
        record.word_count = Some(-1);
        let violations = contract.check_record(&record);
        assert!(violations.iter().any(|v| v.contains("non-negative")));
    }

    #[test]
    fn every_contract_has_required_fields() {
        let config = test_config();
        for contract in builtin_contracts(&config) {
            assert!(
                !contract.required_fields.is_empty(),
                "stage {} contract empty",
                contract.stage
            );
        }
    }
}
