//! Core data models shared across pipeline stages.
//!
//! Entities live in a 12-level hierarchy; this adapter emits levels 2-8.
//! Early stages (1-4) carry message-shaped rows defined locally in their
//! stage modules; the denormalized [`EntityRecord`] here is the shape
//! that flows through aggregation, validation, and promotion.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Position in the entity hierarchy. Lower levels are finer-grained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Token,
    Span,
    Sentence,
    Message,
    Turn,
    Conversation,
}

impl Level {
    pub fn as_i64(self) -> i64 {
        match self {
            Level::Token => 2,
            Level::Span => 3,
            Level::Sentence => 4,
            Level::Message => 5,
            Level::Turn => 6,
            Level::Conversation => 8,
        }
    }

    pub fn from_i64(level: i64) -> Option<Level> {
        match level {
            2 => Some(Level::Token),
            3 => Some(Level::Span),
            4 => Some(Level::Sentence),
            5 => Some(Level::Message),
            6 => Some(Level::Turn),
            8 => Some(Level::Conversation),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Level::Token => "token",
            Level::Span => "span",
            Level::Sentence => "sentence",
            Level::Message => "message",
            Level::Turn => "turn",
            Level::Conversation => "conversation",
        }
    }
}

/// Levels a promoted entity may carry.
pub const VALID_LEVELS: &[i64] = &[2, 3, 4, 5, 6, 8];

/// Relationship edge types emitted by stage 13.
pub mod rel {
    /// Structural containment, derived from `parent_id`.
    pub const PARENT_CHILD: &str = "parent_child";
    /// user → assistant adjacency within a session.
    pub const REPLIES_TO: &str = "REPLIES_TO";
    /// assistant → user adjacency within a session.
    pub const CONTINUES: &str = "CONTINUES";
}

/// Message roles accepted by the extraction envelope.
pub const VALID_ROLES: &[&str] = &["user", "assistant", "tool", "system"];

/// Denormalized entity row: the union shape written by stage 14, judged
/// by stage 15, and promoted by stage 16.
#[derive(Debug, Clone, Default)]
pub struct EntityRecord {
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub source_name: String,
    pub source_pipeline: String,
    pub level: i64,
    pub text: Option<String>,
    pub role: Option<String>,
    pub message_type: Option<String>,
    pub message_index: Option<i64>,
    pub sentence_index: Option<i64>,
    pub word_count: Option<i64>,
    pub char_count: Option<i64>,
    pub model: Option<String>,
    pub cost_usd: Option<f64>,
    pub tool_name: Option<String>,
    pub embedding: Option<Vec<u8>>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<i64>,
    pub primary_emotion: Option<String>,
    pub primary_emotion_score: Option<f64>,
    pub emotions_detected: Option<String>,
    pub intent: Option<String>,
    pub task_type: Option<String>,
    pub code_languages: Option<String>,
    pub complexity: Option<String>,
    pub has_code_block: Option<bool>,
    pub keywords: Option<String>,
    pub top_keyword: Option<String>,
    pub keyword_count: Option<i64>,
    pub child_count: Option<i64>,
    pub total_word_count: Option<i64>,
    pub session_id: String,
    pub content_date: Option<String>,
    pub timestamp_utc: Option<String>,
    pub fingerprint: Option<String>,
    pub created_at: String,
    pub run_id: String,
}

impl EntityRecord {
    /// Read the shared columns out of a stage 14 / stage 15 row.
    pub fn from_row(row: &SqliteRow) -> Result<EntityRecord> {
        Ok(EntityRecord {
            entity_id: row.try_get("entity_id")?,
            parent_id: row.try_get("parent_id")?,
            source_name: row.try_get("source_name")?,
            source_pipeline: row.try_get("source_pipeline")?,
            level: row.try_get("level")?,
            text: row.try_get("text")?,
            role: row.try_get("role")?,
            message_type: row.try_get("message_type")?,
            message_index: row.try_get("message_index")?,
            sentence_index: row.try_get("sentence_index")?,
            word_count: row.try_get("word_count")?,
            char_count: row.try_get("char_count")?,
            model: row.try_get("model")?,
            cost_usd: row.try_get("cost_usd")?,
            tool_name: row.try_get("tool_name")?,
            embedding: row.try_get("embedding")?,
            embedding_model: row.try_get("embedding_model")?,
            embedding_dimension: row.try_get("embedding_dimension")?,
            primary_emotion: row.try_get("primary_emotion")?,
            primary_emotion_score: row.try_get("primary_emotion_score")?,
            emotions_detected: row.try_get("emotions_detected")?,
            intent: row.try_get("intent")?,
            task_type: row.try_get("task_type")?,
            code_languages: row.try_get("code_languages")?,
            complexity: row.try_get("complexity")?,
            has_code_block: row.try_get("has_code_block")?,
            keywords: row.try_get("keywords")?,
            top_keyword: row.try_get("top_keyword")?,
            keyword_count: row.try_get("keyword_count")?,
            child_count: row.try_get("child_count")?,
            total_word_count: row.try_get("total_word_count")?,
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
            timestamp_utc: row.try_get("timestamp_utc")?,
            fingerprint: row.try_get("fingerprint")?,
            created_at: row.try_get("created_at")?,
            run_id: row.try_get("run_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        for &n in VALID_LEVELS {
            let level = Level::from_i64(n).unwrap();
            assert_eq!(level.as_i64(), n);
        }
        assert!(Level::from_i64(1).is_none());
        assert!(Level::from_i64(7).is_none());
        assert!(Level::from_i64(9).is_none());
    }

    #[test]
    fn conversation_outranks_message() {
        assert!(Level::Conversation.as_i64() > Level::Message.as_i64());
        assert!(Level::Message.as_i64() > Level::Sentence.as_i64());
        assert!(Level::Sentence.as_i64() > Level::Span.as_i64());
    }

    #[test]
    fn labels_are_distinct() {
        let labels: std::collections::HashSet<&str> = [
            Level::Token,
            Level::Span,
            Level::Sentence,
            Level::Message,
            Level::Turn,
            Level::Conversation,
        ]
        .into_iter()
        .map(Level::label)
        .collect();
        assert_eq!(labels.len(), 6);
    }
}
