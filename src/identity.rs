//! Entity identity generation and per-run registration.
//!
//! Every entity in the warehouse is identified by a 32-character lowercase
//! hex id derived from a tagged SHA-256 over a stable input tuple, so that
//! re-extracting the same underlying content reproduces the same id. The
//! Gate (stage 3) registers each freshly minted id with an
//! [`IdentityRegistry`]; a second registration of the same id within one
//! run is an integrity violation.

use std::collections::HashSet;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of every entity id, in hex characters.
pub const ENTITY_ID_LEN: usize = 32;

fn hash_hex(content: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

/// Canonical message id. Stable across re-extractions of the same
/// underlying message: the tuple (parent, source GUID, fingerprint) does
/// not change when a session file is parsed again.
pub fn message_id_from_guid(parent_id: &str, guid: &str, fingerprint: &str) -> String {
    hash_hex(&format!("msg:{}:{}:{}", parent_id, guid, fingerprint), ENTITY_ID_LEN)
}

/// Conversation (L8) id derived from the session. The hash convention is
/// canonical; `session_id` itself is never used as an entity id.
pub fn conversation_id(source_name: &str, session_id: &str) -> String {
    hash_hex(&format!("conv:{}:{}", source_name, session_id), ENTITY_ID_LEN)
}

/// Sentence id, deterministic per (parent message, index).
pub fn sentence_id(parent_id: &str, sentence_index: i64) -> String {
    hash_hex(&format!("sent:{}:{}", parent_id, sentence_index), ENTITY_ID_LEN)
}

/// Span id, deterministic per (parent sentence, index).
pub fn span_id(parent_id: &str, span_index: i64) -> String {
    hash_hex(&format!("span:{}:{}", parent_id, span_index), ENTITY_ID_LEN)
}

/// Relationship edge id: 16 hex chars over endpoints + type.
pub fn relationship_id(source_id: &str, target_id: &str, rel_type: &str) -> String {
    hash_hex(&format!("rel:{}:{}:{}", source_id, target_id, rel_type), 16)
}

/// Content fingerprint used for duplicate detection and as a stable
/// component of message identity.
pub fn fingerprint(session_id: &str, message_index: i64, content: &str) -> String {
    hash_hex(
        &format!("{}:{}:{}", session_id, message_index, content),
        ENTITY_ID_LEN,
    )
}

/// Session id derived from the source file path.
pub fn session_id_from_path(path: &str) -> String {
    hash_hex(path, 16)
}

/// Fresh run id: UTC timestamp prefix for sortability, random suffix for
/// global uniqueness.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", stamp, &suffix[..8])
}

/// True when `id` has the canonical 32-char lowercase hex shape.
pub fn is_canonical_entity_id(id: &str) -> bool {
    id.len() == ENTITY_ID_LEN
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Per-run registry of minted entity ids.
///
/// Stages receive the registry as a constructor argument; the in-memory
/// implementation is sufficient because uniqueness is only enforced
/// within a run (cross-run duplicates are resolved at promotion).
pub trait IdentityRegistry {
    /// Register an id. Returns `false` when the id was already
    /// registered in this run.
    fn register(&mut self, entity_id: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Set-backed registry covering a single run.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    seen: HashSet<String>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityRegistry for InMemoryRegistry {
    fn register(&mut self, entity_id: &str) -> bool {
        self.seen.insert(entity_id.to_string())
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_pure() {
        let a = message_id_from_guid("parent", "guid-1", "fp");
        let b = message_id_from_guid("parent", "guid-1", "fp");
        assert_eq!(a, b);
        assert_ne!(a, message_id_from_guid("parent", "guid-2", "fp"));
        assert_ne!(a, message_id_from_guid("parent", "guid-1", "fp2"));
    }

    #[test]
    fn ids_are_canonical_shape() {
        for id in [
            message_id_from_guid("p", "g", "f"),
            conversation_id("claude_code", "abc"),
            sentence_id("p", 0),
            span_id("p", 3),
            fingerprint("s", 1, "text"),
        ] {
            assert!(is_canonical_entity_id(&id), "not canonical: {}", id);
        }
        assert_eq!(relationship_id("a", "b", "parent_child").len(), 16);
        assert_eq!(session_id_from_path("/tmp/x.jsonl").len(), 16);
    }

    #[test]
    fn no_collisions_across_100k_ids() {
        let mut seen = HashSet::new();
        for i in 0..100_000i64 {
            let id = message_id_from_guid("parent", &format!("guid-{}", i), "fp");
            assert!(seen.insert(id), "collision at {}", i);
        }
    }

    #[test]
    fn distinct_tag_namespaces_do_not_collide() {
        // Same inputs through different generators must yield different ids.
        assert_ne!(sentence_id("p", 0), span_id("p", 0));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut reg = InMemoryRegistry::new();
        assert!(reg.register("aa"));
        assert!(!reg.register("aa"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn run_ids_are_unique_and_well_formed() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run_"));
        assert!(crate::guard::is_valid_identifier(&a));
    }

    #[test]
    fn canonical_id_shape_check() {
        assert!(is_canonical_entity_id(&"a".repeat(32)));
        assert!(!is_canonical_entity_id(&"A".repeat(32)));
        assert!(!is_canonical_entity_id(""));
        assert!(!is_canonical_entity_id(&"a".repeat(31)));
        assert!(!is_canonical_entity_id(&"g".repeat(32)));
    }
}
