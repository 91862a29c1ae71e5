//! # Corpus Loom
//!
//! A staged ingestion pipeline that turns raw AI session logs (one JSONL
//! file per session) into a typed, append-only entity warehouse.
//!
//! The pipeline is a fixed sequence of 17 stages over a SQLite
//! warehouse. Each stage reads the previous stage's table, performs one
//! well-defined transformation, and appends its own table, keyed by the
//! run id so that stages are idempotent, independently verifiable, and
//! individually rollback-able:
//!
//! | stages | responsibility |
//! |--------|----------------|
//! | 0-4    | discovery, extraction (+DLQ), cleaning, identity, repair |
//! | 5-8    | entity derivation: conversations, sentences, messages, spans |
//! | 9-12   | enrichment: embeddings, LLM extraction, sentiment, keywords |
//! | 13-14  | relationships and denormalized rollups |
//! | 15-16  | validation verdicts and promotion to `entity_unified` |
//!
//! Cross-cutting layers: an append-only event store, a content-addressed
//! provenance ledger, per-stage data contracts, and a signals table for
//! skipped work. See the `loom` binary for the CLI surface.

pub mod canonical;
pub mod config;
pub mod contracts;
pub mod db;
pub mod embedding;
pub mod events;
pub mod guard;
pub mod identity;
pub mod keywords;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod provenance;
pub mod retry;
pub mod rollback;
pub mod sentence;
pub mod sentiment;
pub mod stages;
pub mod status;
pub mod tables;
pub mod textutil;
pub mod verify;
