//! Stage 8: L3 spans.
//!
//! Derives clause-level spans from detected sentences by splitting on
//! `;` and `:` boundaries. When the adapter emits sentences at L4, spans
//! parent to the sentence; when sentences are already L3, spans parent
//! to the containing L5 message so parents always sit strictly higher
//! in the hierarchy. Whitespace-only spans are dropped.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use crate::identity::span_id;
use crate::models::Level;
use crate::textutil::{now_utc, word_count};

use super::{ensure_input_rows, StageContext, StageOutcome};

/// Split a sentence into clause spans. Delimiters stay with the clause
/// they close; offsets are character positions within the sentence.
pub(crate) fn clause_spans(text: &str) -> Vec<(String, i64, i64)> {
    let chars: Vec<char> = text.chars().collect();
    let mut spans = Vec::new();
    let mut start = 0usize;

    for (i, &c) in chars.iter().enumerate() {
        if c == ';' || c == ':' {
            push_span(&chars, start, i + 1, &mut spans);
            start = i + 1;
        }
    }
    push_span(&chars, start, chars.len(), &mut spans);
    spans
}

fn push_span(chars: &[char], start: usize, end: usize, spans: &mut Vec<(String, i64, i64)>) {
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    if s == e {
        return;
    }
    let body: String = chars[s..e].iter().collect();
    spans.push((body, s as i64, e as i64));
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ensure_input_rows(ctx, 6).await?;

    let mut outcome = StageOutcome::new(8);
    let created_at = now_utc();
    let sentence_is_l4 = ctx.config.pipeline.sentence_level == Level::Sentence.as_i64();
    let input = ctx.table(6)?;
    let output = ctx.table(8)?;

    let rows = sqlx::query(&format!(
        "SELECT entity_id, parent_id, text, session_id, content_date, valid_time FROM {} WHERE run_id = ? ORDER BY parent_id, sentence_index",
        input
    ))
    .bind(&ctx.run_id)
    .fetch_all(ctx.pool)
    .await?;

    let mut tx = ctx.pool.begin().await?;

    for row in &rows {
        outcome.rows_in += 1;

        let sentence_entity: String = row.try_get("entity_id")?;
        let message_entity: String = row.try_get("parent_id")?;
        let text: String = row.try_get("text")?;
        let session_id: String = row.try_get("session_id")?;
        let content_date: Option<String> = row.try_get("content_date")?;
        let valid_time: Option<String> = row.try_get("valid_time")?;

        // Parent must sit strictly above L3.
        let parent_id = if sentence_is_l4 {
            &sentence_entity
        } else {
            &message_entity
        };

        for (index, (span_text, start_char, end_char)) in
            clause_spans(&text).into_iter().enumerate()
        {
            if ctx.opts.dry_run {
                outcome.rows_out += 1;
                continue;
            }

            let entity_id = span_id(&sentence_entity, index as i64);
            let result = sqlx::query(&format!(
                r#"
                INSERT OR IGNORE INTO {}
                (entity_id, parent_id, source_name, source_pipeline, level, text,
                 span_index, start_char, end_char, word_count, session_id,
                 content_date, created_at, run_id, valid_time, system_time, valid_to)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
                output
            ))
            .bind(&entity_id)
            .bind(parent_id)
            .bind(ctx.source())
            .bind(ctx.pipeline())
            .bind(Level::Span.as_i64())
            .bind(&span_text)
            .bind(index as i64)
            .bind(start_char)
            .bind(end_char)
            .bind(word_count(&span_text))
            .bind(&session_id)
            .bind(&content_date)
            .bind(&created_at)
            .bind(&ctx.run_id)
            .bind(valid_time.as_deref().unwrap_or(&created_at))
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
            outcome.rows_out += result.rows_affected();
        }
    }

    tx.commit().await?;

    info!(run_id = %ctx.run_id, spans = outcome.rows_out, "span derivation complete");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_without_delimiters_is_one_span() {
        let spans = clause_spans("a plain sentence");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].0, "a plain sentence");
    }

    #[test]
    fn splits_on_semicolon_and_colon() {
        let spans = clause_spans("first clause; second clause: third");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].0, "first clause;");
        assert_eq!(spans[1].0, "second clause:");
        assert_eq!(spans[2].0, "third");
    }

    #[test]
    fn whitespace_only_spans_dropped() {
        let spans = clause_spans("alpha;   ; beta");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].0, "beta");
    }

    #[test]
    fn offsets_cover_trimmed_text() {
        let text = "head: tail";
        let chars: Vec<char> = text.chars().collect();
        for (body, start, end) in clause_spans(text) {
            let slice: String = chars[start as usize..end as usize].iter().collect();
            assert_eq!(slice, body);
        }
    }
}
