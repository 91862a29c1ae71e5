//! LLM-backed structured extraction for stage 10.
//!
//! Sends message text to an OpenAI-compatible chat endpoint with a prompt
//! that demands a single strict-JSON object. The response is schema
//! validated before use; a malformed response is a parse failure the
//! stage records as a signal, leaving the fields null.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::retry::{is_retryable_status, retry_with_backoff, RetryPolicy};

pub const TASK_TYPES: &[&str] = &[
    "coding",
    "debugging",
    "explanation",
    "refactoring",
    "configuration",
    "analysis",
    "writing",
    "other",
];

pub const COMPLEXITY_LEVELS: &[&str] = &["trivial", "simple", "moderate", "complex"];

/// Parsed extraction result. All fields nullable: a parse failure leaves
/// everything unset rather than failing the row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmExtraction {
    pub intent: Option<String>,
    pub task_type: Option<String>,
    #[serde(default)]
    pub code_languages: Vec<String>,
    pub complexity: Option<String>,
    pub has_code_block: Option<bool>,
}

fn build_prompt(text: &str) -> String {
    format!(
        "Analyze the following message from a coding assistant session and \
         respond with exactly one JSON object, no prose, with fields: \
         intent (short phrase), task_type (one of {task_types:?}), \
         code_languages (array of language names present), \
         complexity (one of {complexity:?}), has_code_block (boolean).\n\n\
         Message:\n{text}",
        task_types = TASK_TYPES,
        complexity = COMPLEXITY_LEVELS,
        text = text,
    )
}

/// Validate a raw model response against the extraction schema.
pub fn parse_extraction(raw: &str) -> Result<LlmExtraction> {
    // Models occasionally wrap JSON in a code fence; strip it.
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let extraction: LlmExtraction =
        serde_json::from_str(trimmed).context("extraction response is not valid JSON")?;

    if let Some(ref task_type) = extraction.task_type {
        if !TASK_TYPES.contains(&task_type.as_str()) {
            bail!("task_type '{}' outside the allowed set", task_type);
        }
    }
    if let Some(ref complexity) = extraction.complexity {
        if !COMPLEXITY_LEVELS.contains(&complexity.as_str()) {
            bail!("complexity '{}' outside the allowed set", complexity);
        }
    }

    Ok(extraction)
}

/// Call the configured chat endpoint and parse the structured result.
pub async fn extract(config: &LlmConfig, text: &str) -> Result<LlmExtraction> {
    if !config.is_enabled() {
        bail!("LLM provider is disabled");
    }

    let endpoint = config
        .endpoint
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("llm.model required when provider is enabled"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": build_prompt(text)}],
        "temperature": 0,
    });

    let policy = RetryPolicy::new(config.max_retries);
    let json = retry_with_backoff(
        &policy,
        |e| !e.to_string().starts_with("client error"),
        || async {
            let response = client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await?;

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let json: serde_json::Value = response.json().await?;
                return Ok(json);
            }

            let body_text = response.text().await.unwrap_or_default();
            if is_retryable_status(status) {
                bail!("llm API error {}: {}", status, body_text);
            }
            bail!("client error {}: {}", status, body_text);
        },
    )
    .await?;

    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("chat response missing choices[0].message.content"))?;

    parse_extraction(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response() {
        let raw = r#"{"intent": "fix a failing test", "task_type": "debugging",
                      "code_languages": ["rust"], "complexity": "moderate",
                      "has_code_block": true}"#;
        let e = parse_extraction(raw).unwrap();
        assert_eq!(e.intent.as_deref(), Some("fix a failing test"));
        assert_eq!(e.task_type.as_deref(), Some("debugging"));
        assert_eq!(e.code_languages, vec!["rust"]);
        assert_eq!(e.has_code_block, Some(true));
    }

    #[test]
    fn strips_code_fences() {
        let raw = "```json\n{\"intent\": \"greet\", \"task_type\": \"other\"}\n```";
        let e = parse_extraction(raw).unwrap();
        assert_eq!(e.intent.as_deref(), Some("greet"));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_extraction("the intent is to say hello").is_err());
    }

    #[test]
    fn rejects_out_of_set_enums() {
        assert!(parse_extraction(r#"{"task_type": "interpretive_dance"}"#).is_err());
        assert!(parse_extraction(r#"{"complexity": "impossible"}"#).is_err());
    }

    #[test]
    fn missing_fields_default_to_null() {
        let e = parse_extraction("{}").unwrap();
        assert!(e.intent.is_none());
        assert!(e.code_languages.is_empty());
        assert!(e.has_code_block.is_none());
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let config = LlmConfig::default();
        assert!(extract(&config, "hello").await.is_err());
    }
}
