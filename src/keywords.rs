//! Statistical keyword extraction for stage 12.
//!
//! Frequency-scored unigram/bigram candidates with stopword filtering.
//! Scores are normalized to (0, 1] with the top candidate at 1.0, so
//! ranks are comparable across entities. Deterministic: ties break
//! lexicographically.

use std::collections::HashMap;

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him",
    "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "let", "me", "more",
    "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other",
    "our", "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that",
    "the", "their", "them", "then", "there", "these", "they", "this", "those", "through", "to",
    "too", "under", "until", "up", "very", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3 && !t.chars().all(|c| c.is_numeric()))
        .map(str::to_string)
        .collect()
}

/// Extract up to `top_n` (keyword, score) pairs. Texts shorter than
/// `min_text_len` characters yield an empty list.
pub fn extract_keywords(text: &str, top_n: usize, min_text_len: usize) -> Vec<(String, f64)> {
    if text.chars().count() < min_text_len {
        return Vec::new();
    }

    let tokens = tokenize(text);
    let mut counts: HashMap<String, f64> = HashMap::new();

    for token in &tokens {
        if !is_stopword(token) {
            *counts.entry(token.clone()).or_insert(0.0) += 1.0;
        }
    }

    // Bigrams of consecutive non-stopwords score higher than their parts.
    for pair in tokens.windows(2) {
        if !is_stopword(&pair[0]) && !is_stopword(&pair[1]) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            *counts.entry(bigram).or_insert(0.0) += 1.5;
        }
    }

    if counts.is_empty() {
        return Vec::new();
    }

    let max_score = counts.values().cloned().fold(f64::MIN, f64::max);
    let mut scored: Vec<(String, f64)> = counts
        .into_iter()
        .map(|(k, v)| (k, v / max_score))
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(top_n);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopword_list_is_sorted_for_binary_search() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
    }

    #[test]
    fn extracts_dominant_terms() {
        let text = "The parser rejects invalid tokens. The parser caches valid tokens \
                    so parser restarts are cheap.";
        let keywords = extract_keywords(text, 5, 10);
        assert!(!keywords.is_empty());
        assert!(keywords.iter().any(|(k, _)| k.contains("parser")));
        assert_eq!(keywords[0].1, 1.0);
    }

    #[test]
    fn short_text_yields_nothing() {
        assert!(extract_keywords("short", 5, 20).is_empty());
    }

    #[test]
    fn scores_in_unit_interval() {
        let text = "database migrations run in order, database schemas stay append only";
        for (_, score) in extract_keywords(text, 10, 10) {
            assert!(score > 0.0 && score <= 1.0);
        }
    }

    #[test]
    fn stopwords_never_surface_alone() {
        let text = "the the the and and because should would about compile error";
        let keywords = extract_keywords(text, 10, 10);
        for (k, _) in &keywords {
            assert!(!STOPWORDS.contains(&k.as_str()), "stopword leaked: {}", k);
        }
    }

    #[test]
    fn respects_top_n() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        assert!(extract_keywords(text, 3, 10).len() <= 3);
    }

    #[test]
    fn deterministic_ordering() {
        let text = "tokio spawns tasks, sqlx pools connections, serde derives impls";
        assert_eq!(
            extract_keywords(text, 5, 10),
            extract_keywords(text, 5, 10)
        );
    }
}
