use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sentiment: SentimentConfig,
    #[serde(default)]
    pub keywords: KeywordsConfig,
    #[serde(default)]
    pub lineage: LineageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Source system identifier, e.g. `claude_code`. Used as the stage
    /// table prefix and as `source_name` on every entity row.
    pub name: String,
    /// Pipeline identifier stamped as `source_pipeline` on derived rows.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Directory scanned for raw `*.jsonl` session files.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

impl SourceConfig {
    pub fn pipeline_name(&self) -> String {
        self.pipeline
            .clone()
            .unwrap_or_else(|| format!("{}_ingest", self.name))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Level emitted by the sentence stage. Adapters differ: some treat
    /// detected sentences as L4, some as L3. Part of the stage 6 contract.
    #[serde(default = "default_sentence_level")]
    pub sentence_level: i64,
    /// Wall-clock budget per stage when running `loom pipeline`.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Discovery preflight: fraction of sampled lines that may fail to
    /// parse before the manifest verdict flips to NO_GO.
    #[serde(default = "default_malformed_threshold")]
    pub preflight_malformed_threshold: f64,
    /// Directory where discovery manifests are written. Defaults to the
    /// database directory.
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sentence_level: default_sentence_level(),
            stage_timeout_secs: default_stage_timeout_secs(),
            preflight_malformed_threshold: default_malformed_threshold(),
            manifest_dir: None,
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_sentence_level() -> i64 {
    4
}
fn default_stage_timeout_secs() -> u64 {
    3600
}
fn default_malformed_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            endpoint: None,
            max_chars: default_max_chars(),
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_chars() -> usize {
    8000
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            endpoint: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SentimentConfig {
    /// `disabled`, `lexicon` (offline, deterministic), or `api`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Labels scoring below this are dropped from `emotions_detected`.
    #[serde(default = "default_sentiment_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            threshold: default_sentiment_threshold(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SentimentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_sentiment_threshold() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeywordsConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Texts shorter than this yield an empty keyword list.
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            min_text_len: default_min_text_len(),
        }
    }
}

fn default_top_n() -> usize {
    5
}
fn default_min_text_len() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineageConfig {
    /// Write event-store and provenance-ledger rows beside stage output.
    #[serde(default = "default_lineage_enabled")]
    pub enabled: bool,
    /// Bounded depth for causal-chain traversals.
    #[serde(default = "default_causal_depth")]
    pub max_causal_depth: usize,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            enabled: default_lineage_enabled(),
            max_causal_depth: default_causal_depth(),
        }
    }
}

fn default_lineage_enabled() -> bool {
    true
}
fn default_causal_depth() -> usize {
    32
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.source.name.is_empty() {
        anyhow::bail!("source.name must not be empty");
    }
    if !crate::guard::is_valid_identifier(&config.source.name) {
        anyhow::bail!(
            "source.name may only contain letters, digits, '_', '-', '.': '{}'",
            config.source.name
        );
    }

    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }

    if !matches!(config.pipeline.sentence_level, 3 | 4) {
        anyhow::bail!(
            "pipeline.sentence_level must be 3 or 4, got {}",
            config.pipeline.sentence_level
        );
    }

    if !(0.0..=1.0).contains(&config.pipeline.preflight_malformed_threshold) {
        anyhow::bail!("pipeline.preflight_malformed_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.sentiment.provider.as_str() {
        "disabled" | "lexicon" | "api" => {}
        other => anyhow::bail!(
            "Unknown sentiment provider: '{}'. Must be disabled, lexicon, or api.",
            other
        ),
    }
    if config.sentiment.provider == "api" && config.sentiment.endpoint.is_none() {
        anyhow::bail!("sentiment.endpoint required when provider is 'api'");
    }

    if config.keywords.top_n == 0 {
        anyhow::bail!("keywords.top_n must be > 0");
    }

    Ok(config)
}
