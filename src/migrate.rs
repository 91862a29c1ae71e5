//! Warehouse schema creation.
//!
//! Creates every stage table, the DLQ, the canonical `entity_unified`
//! target, and the lineage side tables (event store, provenance ledger,
//! data contracts, pipeline signals). All statements are idempotent;
//! `loom init` can be re-run safely.
//!
//! Stage tables are append-only per `run_id`: primary keys pair the
//! stage's natural key with `run_id`, and stages insert with
//! `INSERT OR IGNORE` so a re-run of the same `run_id` cannot produce
//! duplicate rows. Timestamps are stored as RFC 3339 TEXT (UTC), dates
//! as `YYYY-MM-DD` TEXT, embeddings as little-endian f32 BLOBs.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::contracts;
use crate::db;
use crate::tables;

// Bitemporal triple carried by every stage table: when it happened in
// the domain, when the pipeline recorded it, and (for corrections) when
// the version stopped being current.
const BITEMPORAL: &str = "valid_time TEXT, system_time TEXT, valid_to TEXT";

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_all_tables(&pool, &config.source.name).await?;
    contracts::register_builtin_contracts(&pool, config).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_all_tables(pool: &SqlitePool, source: &str) -> Result<()> {
    let t = |n: i64| tables::stage_table(source, n);

    // Stage 0: one manifest row per run.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            run_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            manifest_path TEXT NOT NULL,
            file_count INTEGER NOT NULL,
            total_size INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            go_no_go TEXT NOT NULL,
            created_at TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (run_id)
        )
        "#,
        t(0)?
    ))
    .execute(pool)
    .await?;

    // Stage 1: raw extracted messages.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            extraction_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            message_index INTEGER NOT NULL,
            message_type TEXT NOT NULL,
            role TEXT,
            content TEXT,
            model TEXT,
            cost_usd REAL,
            tool_name TEXT,
            tool_input TEXT,
            tool_output TEXT,
            source_file TEXT NOT NULL,
            content_date TEXT,
            timestamp_utc TEXT,
            fingerprint TEXT NOT NULL,
            extracted_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (extraction_id, run_id)
        )
        "#,
        t(1)?
    ))
    .execute(pool)
    .await?;

    // Stage 1 DLQ: lines that failed the message envelope.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            dlq_id TEXT NOT NULL,
            source_file TEXT NOT NULL,
            line_offset INTEGER NOT NULL,
            raw_line TEXT NOT NULL,
            error_reason TEXT NOT NULL,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (dlq_id, run_id)
        )
        "#,
        tables::dlq_table(source)?
    ))
    .execute(pool)
    .await?;

    // Stage 2: cleaned text + duplicate flags.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            extraction_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            message_index INTEGER NOT NULL,
            message_type TEXT NOT NULL,
            role TEXT,
            content TEXT,
            content_length INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            model TEXT,
            cost_usd REAL,
            tool_name TEXT,
            source_file TEXT NOT NULL,
            content_date TEXT,
            timestamp_utc TEXT,
            fingerprint TEXT NOT NULL,
            is_duplicate INTEGER NOT NULL DEFAULT 0,
            cleaned_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (extraction_id, run_id)
        )
        "#,
        t(2)?
    ))
    .execute(pool)
    .await?;

    // Stages 3 and 4 share a shape: stage 2 plus identity, then with
    // corrected text.
    for stage in [3i64, 4] {
        let extra = if stage == 3 {
            "identity_created_at TEXT NOT NULL"
        } else {
            "identity_created_at TEXT NOT NULL,\n corrected_at TEXT NOT NULL"
        };
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                entity_id TEXT NOT NULL,
                extraction_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                message_index INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                role TEXT,
                content TEXT,
                content_length INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                model TEXT,
                cost_usd REAL,
                tool_name TEXT,
                source_file TEXT NOT NULL,
                content_date TEXT,
                timestamp_utc TEXT,
                fingerprint TEXT NOT NULL,
                is_duplicate INTEGER NOT NULL DEFAULT 0,
                {extra},
                run_id TEXT NOT NULL,
                {BITEMPORAL},
                PRIMARY KEY (entity_id, run_id)
            )
            "#,
            t(stage)?
        ))
        .execute(pool)
        .await?;
    }

    // Stage 5: L8 conversations.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            parent_id TEXT,
            source_name TEXT NOT NULL,
            source_pipeline TEXT NOT NULL,
            level INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            message_count INTEGER NOT NULL,
            user_message_count INTEGER NOT NULL,
            assistant_message_count INTEGER NOT NULL,
            tool_use_count INTEGER NOT NULL,
            total_word_count INTEGER NOT NULL,
            total_char_count INTEGER NOT NULL,
            total_cost_usd REAL NOT NULL,
            first_message_at TEXT,
            last_message_at TEXT,
            models_used TEXT NOT NULL,
            tools_used TEXT NOT NULL,
            content_date TEXT,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(5)?
    ))
    .execute(pool)
    .await?;

    // Stage 6 sentences and stage 8 spans share a shape.
    for (stage, index_col) in [(6i64, "sentence_index"), (8, "span_index")] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                entity_id TEXT NOT NULL,
                parent_id TEXT NOT NULL,
                source_name TEXT NOT NULL,
                source_pipeline TEXT NOT NULL,
                level INTEGER NOT NULL,
                text TEXT NOT NULL,
                {index_col} INTEGER NOT NULL,
                start_char INTEGER NOT NULL,
                end_char INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                content_date TEXT,
                created_at TEXT NOT NULL,
                run_id TEXT NOT NULL,
                {BITEMPORAL},
                PRIMARY KEY (entity_id, run_id)
            )
            "#,
            t(stage)?
        ))
        .execute(pool)
        .await?;
    }

    // Stage 7: canonical L5 messages.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            source_pipeline TEXT NOT NULL,
            level INTEGER NOT NULL,
            text TEXT,
            role TEXT,
            message_type TEXT NOT NULL,
            message_index INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            char_count INTEGER NOT NULL,
            model TEXT,
            cost_usd REAL,
            tool_name TEXT,
            session_id TEXT NOT NULL,
            content_date TEXT,
            timestamp_utc TEXT,
            fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(7)?
    ))
    .execute(pool)
    .await?;

    // Stage 9: embeddings.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            embedding_dimension INTEGER NOT NULL,
            was_truncated INTEGER NOT NULL DEFAULT 0,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(9)?
    ))
    .execute(pool)
    .await?;

    // Stage 10: LLM extractions.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            intent TEXT,
            task_type TEXT,
            code_languages TEXT,
            complexity TEXT,
            has_code_block INTEGER,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(10)?
    ))
    .execute(pool)
    .await?;

    // Stage 11: sentiment.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            primary_emotion TEXT,
            primary_emotion_score REAL,
            emotions_detected TEXT NOT NULL,
            all_emotion_scores TEXT NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(11)?
    ))
    .execute(pool)
    .await?;

    // Stage 12: keywords.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT NOT NULL,
            keywords TEXT NOT NULL,
            top_keyword TEXT,
            keyword_count INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (entity_id, run_id)
        )
        "#,
        t(12)?
    ))
    .execute(pool)
    .await?;

    // Stage 13: relationship edges.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            relationship_id TEXT NOT NULL,
            source_entity_id TEXT NOT NULL,
            target_entity_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            source_level INTEGER NOT NULL,
            target_level INTEGER NOT NULL,
            strength REAL NOT NULL,
            confidence REAL NOT NULL,
            session_id TEXT,
            content_date TEXT,
            created_at TEXT NOT NULL,
            run_id TEXT NOT NULL,
            {BITEMPORAL},
            PRIMARY KEY (relationship_id, run_id)
        )
        "#,
        t(13)?
    ))
    .execute(pool)
    .await?;

    // Stages 14 and 15 share the denormalized entity shape; 15 adds the
    // validation verdict.
    for stage in [14i64, 15] {
        let validation_cols = if stage == 15 {
            r#"validation_status TEXT NOT NULL,
            validation_score REAL NOT NULL,
            validation_errors TEXT NOT NULL,
            validation_warnings TEXT NOT NULL,
            validated_at TEXT NOT NULL,"#
        } else {
            ""
        };
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                entity_id TEXT NOT NULL,
                parent_id TEXT,
                source_name TEXT NOT NULL,
                source_pipeline TEXT NOT NULL,
                level INTEGER NOT NULL,
                text TEXT,
                role TEXT,
                message_type TEXT,
                message_index INTEGER,
                sentence_index INTEGER,
                word_count INTEGER,
                char_count INTEGER,
                model TEXT,
                cost_usd REAL,
                tool_name TEXT,
                embedding BLOB,
                embedding_model TEXT,
                embedding_dimension INTEGER,
                primary_emotion TEXT,
                primary_emotion_score REAL,
                emotions_detected TEXT,
                intent TEXT,
                task_type TEXT,
                code_languages TEXT,
                complexity TEXT,
                has_code_block INTEGER,
                keywords TEXT,
                top_keyword TEXT,
                keyword_count INTEGER,
                child_count INTEGER,
                total_word_count INTEGER,
                session_id TEXT NOT NULL,
                content_date TEXT,
                timestamp_utc TEXT,
                fingerprint TEXT,
                created_at TEXT NOT NULL,
                {validation_cols}
                run_id TEXT NOT NULL,
                {BITEMPORAL},
                PRIMARY KEY (entity_id, run_id)
            )
            "#,
            t(stage)?
        ))
        .execute(pool)
        .await?;
    }

    // Canonical read target: unique on entity_id across all runs.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity_id TEXT PRIMARY KEY,
            parent_id TEXT,
            source_name TEXT NOT NULL,
            source_pipeline TEXT NOT NULL,
            level INTEGER NOT NULL,
            text TEXT,
            role TEXT,
            message_type TEXT,
            message_index INTEGER,
            sentence_index INTEGER,
            word_count INTEGER,
            char_count INTEGER,
            model TEXT,
            cost_usd REAL,
            tool_name TEXT,
            embedding BLOB,
            embedding_model TEXT,
            embedding_dimension INTEGER,
            primary_emotion TEXT,
            primary_emotion_score REAL,
            emotions_detected TEXT,
            intent TEXT,
            task_type TEXT,
            code_languages TEXT,
            complexity TEXT,
            has_code_block INTEGER,
            keywords TEXT,
            top_keyword TEXT,
            keyword_count INTEGER,
            child_count INTEGER,
            total_word_count INTEGER,
            session_id TEXT NOT NULL,
            content_date TEXT,
            timestamp_utc TEXT,
            fingerprint TEXT,
            created_at TEXT NOT NULL,
            validation_status TEXT,
            validation_score REAL,
            promoted_at TEXT NOT NULL,
            run_id TEXT NOT NULL
        )
        "#,
        tables::ENTITY_UNIFIED
    ))
    .execute(pool)
    .await?;

    // Lineage side tables.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            event_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            previous_event_id TEXT,
            causal_chain TEXT NOT NULL,
            stage INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            system_time TEXT NOT NULL,
            event_hash TEXT NOT NULL
        )
        "#,
        tables::EVENT_STORE
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            provenance_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            stage INTEGER NOT NULL,
            input_hash TEXT NOT NULL,
            output_hash TEXT NOT NULL,
            transformation TEXT NOT NULL,
            params TEXT NOT NULL,
            parent_provenance_id TEXT,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        tables::PROVENANCE_LEDGER
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            stage INTEGER NOT NULL,
            schema_version TEXT NOT NULL,
            required_fields TEXT NOT NULL,
            quality_rules TEXT NOT NULL,
            semantic_rules TEXT NOT NULL,
            compatibility_mode TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            PRIMARY KEY (stage, schema_version)
        )
        "#,
        tables::DATA_CONTRACTS
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            signal_id TEXT PRIMARY KEY,
            stage INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            entity_id TEXT,
            signal_type TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        tables::PIPELINE_SIGNALS
    ))
    .execute(pool)
    .await?;

    create_indexes(pool, source).await?;
    Ok(())
}

async fn create_indexes(pool: &SqlitePool, source: &str) -> Result<()> {
    // run_id is the rollback predicate on every stage table.
    for stage in 1..=15i64 {
        let table = tables::stage_table(source, stage)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_run_id ON {table}(run_id)"
        ))
        .execute(pool)
        .await?;
    }
    for stage in [1i64, 2, 3, 4, 6, 7, 8] {
        let table = tables::stage_table(source, stage)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_session ON {table}(session_id)"
        ))
        .execute(pool)
        .await?;
    }

    let dlq = tables::dlq_table(source)?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{dlq}_run_id ON {dlq}(run_id)"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_entity_unified_run_id ON {}(run_id)",
        tables::ENTITY_UNIFIED
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_entity_unified_session ON {}(session_id, level)",
        tables::ENTITY_UNIFIED
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_event_store_entity ON {}(entity_id, system_time)",
        tables::EVENT_STORE
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_provenance_entity ON {}(entity_id)",
        tables::PROVENANCE_LEDGER
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_signals_run ON {}(run_id, stage)",
        tables::PIPELINE_SIGNALS
    ))
    .execute(pool)
    .await?;

    Ok(())
}
