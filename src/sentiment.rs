//! Multi-label emotion classification for stage 11.
//!
//! Three providers:
//! - **disabled** — stage skips itself.
//! - **lexicon** — embedded emotion lexicon, fully offline and
//!   deterministic; the default for local runs and tests.
//! - **api** — an HTTP inference endpoint returning `[{label, score}]`
//!   (Hugging Face text-classification shape), with retry.
//!
//! The top-scoring label becomes `primary_emotion`; the full distribution
//! is kept, and labels under the configured threshold are dropped from
//! `emotions_detected`.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::SentimentConfig;
use crate::retry::{is_retryable_status, retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, Default)]
pub struct SentimentResult {
    pub primary_emotion: Option<String>,
    pub primary_emotion_score: Option<f64>,
    /// Full (label, score) distribution, descending by score.
    pub all_scores: Vec<(String, f64)>,
    /// Labels at or above the threshold.
    pub detected: Vec<String>,
}

const LEXICON: &[(&str, &[&str])] = &[
    (
        "joy",
        &["great", "love", "happy", "excellent", "wonderful", "glad", "awesome", "perfect", "nice", "excited"],
    ),
    (
        "gratitude",
        &["thanks", "thank", "appreciate", "grateful", "helpful"],
    ),
    (
        "sadness",
        &["sad", "sorry", "unfortunately", "regret", "lost", "missing", "disappointed"],
    ),
    (
        "anger",
        &["angry", "furious", "annoying", "hate", "terrible", "awful", "ridiculous", "frustrated", "frustrating"],
    ),
    (
        "fear",
        &["afraid", "worried", "scared", "dangerous", "risk", "anxious", "concern", "concerned"],
    ),
    (
        "surprise",
        &["wow", "surprised", "unexpected", "suddenly", "amazing", "unbelievable"],
    ),
    (
        "confusion",
        &["confused", "unclear", "weird", "strange", "why", "odd", "puzzled"],
    ),
    (
        "curiosity",
        &["wonder", "curious", "interesting", "how", "what", "explore"],
    ),
];

/// Classify with the embedded lexicon. Scores are match counts
/// normalized over all matched labels; a text with no matches is
/// `neutral` at 1.0.
pub fn classify_lexicon(text: &str) -> Vec<(String, f64)> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.is_empty() {
        return vec![("neutral".to_string(), 1.0)];
    }

    let mut counts: Vec<(String, f64)> = Vec::new();
    for (label, words) in LEXICON {
        let hits = tokens.iter().filter(|t| words.contains(*t)).count();
        if hits > 0 {
            counts.push((label.to_string(), hits as f64));
        }
    }

    if counts.is_empty() {
        return vec![("neutral".to_string(), 1.0)];
    }

    let total: f64 = counts.iter().map(|(_, c)| c).sum();
    for entry in &mut counts {
        entry.1 /= total;
    }
    counts.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    counts
}

/// Shape raw (label, score) pairs into a [`SentimentResult`] under the
/// configured threshold.
pub fn shape_result(mut scores: Vec<(String, f64)>, threshold: f64) -> SentimentResult {
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let primary = scores.first().cloned();
    let detected = scores
        .iter()
        .filter(|(_, s)| *s >= threshold)
        .map(|(l, _)| l.clone())
        .collect();

    SentimentResult {
        primary_emotion: primary.as_ref().map(|(l, _)| l.clone()),
        primary_emotion_score: primary.map(|(_, s)| s),
        all_scores: scores,
        detected,
    }
}

/// Classify one text with the configured provider.
pub async fn classify(config: &SentimentConfig, text: &str) -> Result<SentimentResult> {
    match config.provider.as_str() {
        "lexicon" => Ok(shape_result(classify_lexicon(text), config.threshold)),
        "api" => {
            let scores = classify_api(config, text).await?;
            Ok(shape_result(scores, config.threshold))
        }
        "disabled" => bail!("Sentiment provider is disabled"),
        other => bail!("Unknown sentiment provider: {}", other),
    }
}

async fn classify_api(config: &SentimentConfig, text: &str) -> Result<Vec<(String, f64)>> {
    let endpoint = config
        .endpoint
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("sentiment.endpoint required for api provider"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({ "inputs": text });

    let policy = RetryPolicy::new(config.max_retries);
    let json = retry_with_backoff(
        &policy,
        |e| !e.to_string().starts_with("client error"),
        || async {
            let response = client.post(endpoint).json(&body).send().await?;
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let json: serde_json::Value = response.json().await?;
                return Ok(json);
            }
            let body_text = response.text().await.unwrap_or_default();
            if is_retryable_status(status) {
                bail!("sentiment API error {}: {}", status, body_text);
            }
            bail!("client error {}: {}", status, body_text);
        },
    )
    .await?;

    parse_classifier_response(&json)
}

/// Accept both `[{label, score}]` and the nested `[[{label, score}]]`
/// form that batch endpoints return.
fn parse_classifier_response(json: &serde_json::Value) -> Result<Vec<(String, f64)>> {
    let items = match json {
        serde_json::Value::Array(outer) if outer.first().is_some_and(|v| v.is_array()) => {
            outer[0].as_array().cloned().unwrap_or_default()
        }
        serde_json::Value::Array(outer) => outer.clone(),
        _ => bail!("classifier response is not an array"),
    };

    let mut scores = Vec::with_capacity(items.len());
    for item in items {
        let label = item
            .get("label")
            .and_then(|l| l.as_str())
            .ok_or_else(|| anyhow::anyhow!("classifier item missing label"))?;
        let score = item
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow::anyhow!("classifier item missing score"))?;
        scores.push((label.to_string(), score));
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_detects_joy() {
        let scores = classify_lexicon("This is great, I love it, happy to help!");
        assert_eq!(scores[0].0, "joy");
        assert!(scores[0].1 > 0.5);
    }

    #[test]
    fn lexicon_neutral_on_no_match() {
        let scores = classify_lexicon("the function returns an integer");
        assert_eq!(scores, vec![("neutral".to_string(), 1.0)]);
    }

    #[test]
    fn lexicon_is_deterministic() {
        let text = "thanks, this is great but the bug is frustrating";
        assert_eq!(classify_lexicon(text), classify_lexicon(text));
    }

    #[test]
    fn scores_are_normalized() {
        let scores = classify_lexicon("happy happy angry");
        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_filters_detected() {
        let result = shape_result(
            vec![("joy".into(), 0.8), ("fear".into(), 0.05)],
            0.1,
        );
        assert_eq!(result.primary_emotion.as_deref(), Some("joy"));
        assert_eq!(result.detected, vec!["joy"]);
        assert_eq!(result.all_scores.len(), 2);
    }

    #[test]
    fn parses_nested_classifier_response() {
        let json = serde_json::json!([[
            {"label": "joy", "score": 0.9},
            {"label": "anger", "score": 0.1},
        ]]);
        let scores = parse_classifier_response(&json).unwrap();
        assert_eq!(scores[0], ("joy".to_string(), 0.9));
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let config = SentimentConfig::default();
        assert!(classify(&config, "x").await.is_err());
    }
}
