//! Stage 14: aggregation.
//!
//! Collapses the derived entities (conversations, messages, sentences,
//! spans) into one denormalized table, attaching enrichment columns by
//! entity id and computing child-count rollups. Pure reshaping: no new
//! entities are created here.

use std::collections::HashMap;

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::models::{EntityRecord, Level};
use crate::textutil::now_utc;

use super::{ensure_input_rows, StageContext, StageOutcome};

#[derive(Default, Clone)]
struct Enrichment {
    embedding: Option<Vec<u8>>,
    embedding_model: Option<String>,
    embedding_dimension: Option<i64>,
    primary_emotion: Option<String>,
    primary_emotion_score: Option<f64>,
    emotions_detected: Option<String>,
    intent: Option<String>,
    task_type: Option<String>,
    code_languages: Option<String>,
    complexity: Option<String>,
    has_code_block: Option<bool>,
    keywords: Option<String>,
    top_keyword: Option<String>,
    keyword_count: Option<i64>,
}

async fn child_counts(
    pool: &SqlitePool,
    table: &str,
    run_id: &str,
) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query(&format!(
        "SELECT parent_id, COUNT(*) AS n FROM {} WHERE run_id = ? GROUP BY parent_id",
        table
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    let mut counts = HashMap::new();
    for row in rows {
        let parent: String = row.try_get("parent_id")?;
        let n: i64 = row.try_get("n")?;
        counts.insert(parent, n);
    }
    Ok(counts)
}

async fn load_enrichments(
    ctx: &StageContext<'_>,
) -> Result<HashMap<String, Enrichment>> {
    let mut map: HashMap<String, Enrichment> = HashMap::new();

    let embeddings = sqlx::query(&format!(
        "SELECT entity_id, embedding, embedding_model, embedding_dimension FROM {} WHERE run_id = ?",
        ctx.table(9)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in embeddings {
        let entry = map.entry(row.try_get("entity_id")?).or_default();
        entry.embedding = row.try_get("embedding")?;
        entry.embedding_model = row.try_get("embedding_model")?;
        entry.embedding_dimension = row.try_get("embedding_dimension")?;
    }

    let extractions = sqlx::query(&format!(
        "SELECT entity_id, intent, task_type, code_languages, complexity, has_code_block FROM {} WHERE run_id = ?",
        ctx.table(10)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in extractions {
        let entry = map.entry(row.try_get("entity_id")?).or_default();
        entry.intent = row.try_get("intent")?;
        entry.task_type = row.try_get("task_type")?;
        entry.code_languages = row.try_get("code_languages")?;
        entry.complexity = row.try_get("complexity")?;
        entry.has_code_block = row
            .try_get::<Option<i64>, _>("has_code_block")?
            .map(|v| v != 0);
    }

    let sentiments = sqlx::query(&format!(
        "SELECT entity_id, primary_emotion, primary_emotion_score, emotions_detected FROM {} WHERE run_id = ?",
        ctx.table(11)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in sentiments {
        let entry = map.entry(row.try_get("entity_id")?).or_default();
        entry.primary_emotion = row.try_get("primary_emotion")?;
        entry.primary_emotion_score = row.try_get("primary_emotion_score")?;
        entry.emotions_detected = row.try_get("emotions_detected")?;
    }

    let keywords = sqlx::query(&format!(
        "SELECT entity_id, keywords, top_keyword, keyword_count FROM {} WHERE run_id = ?",
        ctx.table(12)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in keywords {
        let entry = map.entry(row.try_get("entity_id")?).or_default();
        entry.keywords = row.try_get("keywords")?;
        entry.top_keyword = row.try_get("top_keyword")?;
        entry.keyword_count = row.try_get("keyword_count")?;
    }

    Ok(map)
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 7).await?;

    let mut outcome = StageOutcome::new(14);
    let created_at = now_utc();
    let output = ctx.table(14)?;

    let enrichments = load_enrichments(ctx).await?;
    let sentence_counts = child_counts(ctx.pool, &ctx.table(6)?, &ctx.run_id).await?;
    let span_counts = child_counts(ctx.pool, &ctx.table(8)?, &ctx.run_id).await?;

    let mut records: Vec<EntityRecord> = Vec::new();

    // L8 conversations.
    let conversations = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id",
        ctx.table(5)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in &conversations {
        outcome.rows_in += 1;
        records.push(EntityRecord {
            entity_id: row.try_get("entity_id")?,
            parent_id: None,
            source_name: row.try_get("source_name")?,
            source_pipeline: row.try_get("source_pipeline")?,
            level: Level::Conversation.as_i64(),
            word_count: Some(row.try_get::<i64, _>("total_word_count")?),
            char_count: Some(row.try_get::<i64, _>("total_char_count")?),
            cost_usd: Some(row.try_get::<f64, _>("total_cost_usd")?),
            child_count: Some(row.try_get::<i64, _>("message_count")?),
            total_word_count: Some(row.try_get::<i64, _>("total_word_count")?),
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
            timestamp_utc: row.try_get("first_message_at")?,
            created_at: created_at.clone(),
            run_id: ctx.run_id.clone(),
            ..Default::default()
        });
    }

    // L5 messages, with enrichments attached.
    let messages = sqlx::query(&format!(
        "SELECT * FROM {} WHERE run_id = ? ORDER BY session_id, message_index",
        ctx.table(7)?
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;
    for row in &messages {
        outcome.rows_in += 1;
        let entity_id: String = row.try_get("entity_id")?;
        let enrichment = enrichments.get(&entity_id).cloned().unwrap_or_default();
        let word_count: i64 = row.try_get("word_count")?;

        records.push(EntityRecord {
            entity_id: entity_id.clone(),
            parent_id: row.try_get("parent_id")?,
            source_name: row.try_get("source_name")?,
            source_pipeline: row.try_get("source_pipeline")?,
            level: Level::Message.as_i64(),
            text: row.try_get("text")?,
            role: row.try_get("role")?,
            message_type: row.try_get("message_type")?,
            message_index: Some(row.try_get::<i64, _>("message_index")?),
            sentence_index: None,
            word_count: Some(word_count),
            char_count: Some(row.try_get::<i64, _>("char_count")?),
            model: row.try_get("model")?,
            cost_usd: row.try_get("cost_usd")?,
            tool_name: row.try_get("tool_name")?,
            embedding: enrichment.embedding,
            embedding_model: enrichment.embedding_model,
            embedding_dimension: enrichment.embedding_dimension,
            primary_emotion: enrichment.primary_emotion,
            primary_emotion_score: enrichment.primary_emotion_score,
            emotions_detected: enrichment.emotions_detected,
            intent: enrichment.intent,
            task_type: enrichment.task_type,
            code_languages: enrichment.code_languages,
            complexity: enrichment.complexity,
            has_code_block: enrichment.has_code_block,
            keywords: enrichment.keywords,
            top_keyword: enrichment.top_keyword,
            keyword_count: enrichment.keyword_count,
            child_count: Some(sentence_counts.get(&entity_id).copied().unwrap_or(0)),
            total_word_count: Some(word_count),
            session_id: row.try_get("session_id")?,
            content_date: row.try_get("content_date")?,
            timestamp_utc: row.try_get("timestamp_utc")?,
            fingerprint: row.try_get("fingerprint")?,
            created_at: created_at.clone(),
            run_id: ctx.run_id.clone(),
        });
    }

    // Sentences and spans.
    for (stage, index_col) in [(6i64, "sentence_index"), (8, "span_index")] {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE run_id = ? ORDER BY parent_id, {}",
            ctx.table(stage)?,
            index_col
        ))
        .bind(&ctx.run_id)
        .fetch_all(ctx.pool)
        .await?;

        for row in &rows {
            outcome.rows_in += 1;
            let entity_id: String = row.try_get("entity_id")?;
            let child_count = if stage == 6 {
                span_counts.get(&entity_id).copied().unwrap_or(0)
            } else {
                0
            };
            records.push(EntityRecord {
                entity_id,
                parent_id: Some(row.try_get::<String, _>("parent_id")?),
                source_name: row.try_get("source_name")?,
                source_pipeline: row.try_get("source_pipeline")?,
                level: row.try_get("level")?,
                text: Some(row.try_get::<String, _>("text")?),
                sentence_index: Some(row.try_get::<i64, _>(index_col)?),
                word_count: Some(row.try_get::<i64, _>("word_count")?),
                child_count: Some(child_count),
                session_id: row.try_get("session_id")?,
                content_date: row.try_get("content_date")?,
                created_at: created_at.clone(),
                run_id: ctx.run_id.clone(),
                ..Default::default()
            });
        }
    }

    if ctx.opts.dry_run {
        outcome.note(format!("dry-run: {} aggregated rows", records.len()));
        return Ok(outcome);
    }

    let mut tx = ctx.pool.begin().await?;
    for record in &records {
        let result = insert_aggregate(&mut tx, &output, record).await?;
        outcome.rows_out += result;
    }
    tx.commit().await?;

    info!(run_id = %ctx.run_id, aggregated = outcome.rows_out, "aggregation complete");
    Ok(outcome)
}

async fn insert_aggregate(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    r: &EntityRecord,
) -> Result<u64> {
    let result = sqlx::query(&format!(
        r#"
        INSERT OR IGNORE INTO {}
        (entity_id, parent_id, source_name, source_pipeline, level, text, role,
         message_type, message_index, sentence_index, word_count, char_count,
         model, cost_usd, tool_name, embedding, embedding_model, embedding_dimension,
         primary_emotion, primary_emotion_score, emotions_detected, intent, task_type,
         code_languages, complexity, has_code_block, keywords, top_keyword,
         keyword_count, child_count, total_word_count, session_id, content_date,
         timestamp_utc, fingerprint, created_at, run_id, valid_time, system_time, valid_to)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
        table
    ))
    .bind(&r.entity_id)
    .bind(&r.parent_id)
    .bind(&r.source_name)
    .bind(&r.source_pipeline)
    .bind(r.level)
    .bind(&r.text)
    .bind(&r.role)
    .bind(&r.message_type)
    .bind(r.message_index)
    .bind(r.sentence_index)
    .bind(r.word_count)
    .bind(r.char_count)
    .bind(&r.model)
    .bind(r.cost_usd)
    .bind(&r.tool_name)
    .bind(&r.embedding)
    .bind(&r.embedding_model)
    .bind(r.embedding_dimension)
    .bind(&r.primary_emotion)
    .bind(r.primary_emotion_score)
    .bind(&r.emotions_detected)
    .bind(&r.intent)
    .bind(&r.task_type)
    .bind(&r.code_languages)
    .bind(&r.complexity)
    .bind(r.has_code_block.map(|b| b as i64))
    .bind(&r.keywords)
    .bind(&r.top_keyword)
    .bind(r.keyword_count)
    .bind(r.child_count)
    .bind(r.total_word_count)
    .bind(&r.session_id)
    .bind(&r.content_date)
    .bind(&r.timestamp_utc)
    .bind(&r.fingerprint)
    .bind(&r.created_at)
    .bind(&r.run_id)
    .bind(r.timestamp_utc.as_deref().unwrap_or(&r.created_at))
    .bind(&r.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}
