//! Canonical JSON serialization and content-addressed hashing.
//!
//! Provenance and event hashes must be stable across runs and processes,
//! so objects are serialized with recursively sorted keys before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// SHA-256 over the canonical serialization, full hex.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    #[test]
    fn canonical_form_is_sorted() {
        let v = json!({"z": 1, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn hash_is_stable() {
        let v = json!({"entity_id": "abc", "text": "hello"});
        assert_eq!(content_hash(&v), content_hash(&v));
        assert_eq!(content_hash(&v).len(), 64);
    }
}
