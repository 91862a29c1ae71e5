//! End-to-end pipeline scenarios over a temporary warehouse.
//!
//! Each test builds a fresh SQLite database and session directory,
//! runs discovery plus stages 1-16 in-process, and asserts on the
//! resulting tables. Embedding and LLM providers stay disabled so the
//! suite is fully offline; sentiment uses the deterministic lexicon.

use std::fs;
use std::path::Path;

use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use corpus_loom::config::Config;
use corpus_loom::db;
use corpus_loom::migrate;
use corpus_loom::rollback;
use corpus_loom::stages::{self, stage_00_discovery, StageContext, StageOptions};
use corpus_loom::tables;

fn test_config(root: &Path) -> Config {
    let toml = format!(
        r#"
        [db]
        path = "{root}/data/loom.sqlite"

        [source]
        name = "claude_code"
        root = "{root}/sessions"

        [pipeline]
        batch_size = 500
        sentence_level = 4

        [sentiment]
        provider = "lexicon"

        [keywords]
        top_n = 5
        min_text_len = 20
        "#,
        root = root.display()
    );
    toml::from_str(&toml).expect("test config parses")
}

async fn setup(root: &Path) -> (Config, SqlitePool) {
    fs::create_dir_all(root.join("sessions")).unwrap();
    let config = test_config(root);
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    (config, pool)
}

fn write_session(root: &Path, name: &str, lines: &[&str]) {
    fs::write(root.join("sessions").join(name), lines.join("\n")).unwrap();
}

async fn discover(config: &Config, pool: &SqlitePool, run_id: &str) -> stage_00_discovery::Manifest {
    let ctx = StageContext::new(pool, config, run_id.to_string(), StageOptions::default());
    stage_00_discovery::run(&ctx).await.unwrap()
}

async fn run_stages(config: &Config, pool: &SqlitePool, run_id: &str, from: i64, to: i64) {
    for stage in from..=to {
        let ctx = StageContext::new(pool, config, run_id.to_string(), StageOptions::default());
        stages::run_stage(&ctx, stage)
            .await
            .unwrap_or_else(|e| panic!("stage {} failed: {}", stage, e));
    }
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn count_for_run(pool: &SqlitePool, table: &str, run_id: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE run_id = ?", table))
        .bind(run_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

const USER_HELLO: &str =
    r#"{"type":"message","role":"user","content":"Hello","timestamp":"2024-01-01T00:00:00Z"}"#;
const ASSISTANT_HI: &str =
    r#"{"type":"message","role":"assistant","content":"Hi","timestamp":"2024-01-01T00:00:05Z"}"#;

#[tokio::test]
async fn empty_session_is_no_go_with_no_downstream_writes() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "sess_empty.jsonl", &[""]);

    let manifest = discover(&config, &pool, "run_s1").await;
    assert_eq!(manifest.file_count, 1);
    assert_eq!(manifest.go_no_go, "NO_GO(no_messages)");

    // Extraction refuses to start on a NO_GO manifest.
    let ctx = StageContext::new(&pool, &config, "run_s1".to_string(), StageOptions::default());
    let err = stages::run_stage(&ctx, 1).await.unwrap_err();
    assert!(err.to_string().contains("NO_GO"));
    assert_eq!(count(&pool, "claude_code_stage_1").await, 0);
}

#[tokio::test]
async fn single_pair_derives_expected_entities() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_s2").await;
    run_stages(&config, &pool, "run_s2", 1, 16).await;

    // Two canonical L5 messages sharing a session.
    let messages = sqlx::query(
        "SELECT entity_id, level, message_index, session_id FROM claude_code_stage_7 ORDER BY message_index",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(messages.len(), 2);
    let session_a: String = messages[0].try_get("session_id").unwrap();
    let session_b: String = messages[1].try_get("session_id").unwrap();
    assert_eq!(session_a, session_b);
    for (i, row) in messages.iter().enumerate() {
        assert_eq!(row.try_get::<i64, _>("level").unwrap(), 5);
        assert_eq!(row.try_get::<i64, _>("message_index").unwrap(), i as i64);
    }

    // One L8 conversation with the right counters.
    let conv = sqlx::query("SELECT * FROM claude_code_stage_5")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(conv.len(), 1);
    assert_eq!(conv[0].try_get::<i64, _>("level").unwrap(), 8);
    assert_eq!(conv[0].try_get::<i64, _>("message_count").unwrap(), 2);
    assert_eq!(conv[0].try_get::<i64, _>("user_message_count").unwrap(), 1);
    assert_eq!(conv[0].try_get::<i64, _>("assistant_message_count").unwrap(), 1);

    // Exactly one REPLIES_TO edge, from the user message to the reply.
    let entity_0: String = messages[0].try_get("entity_id").unwrap();
    let entity_1: String = messages[1].try_get("entity_id").unwrap();
    let replies = sqlx::query(
        "SELECT source_entity_id, target_entity_id FROM claude_code_stage_13 WHERE relationship_type = 'REPLIES_TO'",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].try_get::<String, _>("source_entity_id").unwrap(), entity_0);
    assert_eq!(replies[0].try_get::<String, _>("target_entity_id").unwrap(), entity_1);
}

#[tokio::test]
async fn malformed_line_routes_to_dlq() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(
        tmp.path(),
        "broken.jsonl",
        &[USER_HELLO, "{not json", ASSISTANT_HI],
    );

    discover(&config, &pool, "run_s3").await;
    run_stages(&config, &pool, "run_s3", 1, 2).await;

    assert_eq!(count(&pool, "claude_code_stage_1").await, 2);

    let dlq = sqlx::query("SELECT line_offset, error_reason FROM claude_code_stage_1_dlq")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].try_get::<i64, _>("line_offset").unwrap(), 2);
    assert!(dlq[0]
        .try_get::<String, _>("error_reason")
        .unwrap()
        .starts_with("invalid_json"));

    assert_eq!(count(&pool, "claude_code_stage_2").await, 2);
}

#[tokio::test]
async fn rerun_with_same_run_id_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_s4").await;
    run_stages(&config, &pool, "run_s4", 1, 16).await;

    let mut first_counts = Vec::new();
    for stage in 1..=15i64 {
        let table = tables::stage_table("claude_code", stage).unwrap();
        first_counts.push(count_for_run(&pool, &table, "run_s4").await);
    }
    let unified_first = count(&pool, "entity_unified").await;
    assert!(unified_first > 0);

    // The whole pipeline again, same run id.
    discover(&config, &pool, "run_s4").await;
    run_stages(&config, &pool, "run_s4", 1, 16).await;

    for (i, stage) in (1..=15i64).enumerate() {
        let table = tables::stage_table("claude_code", stage).unwrap();
        assert_eq!(
            count_for_run(&pool, &table, "run_s4").await,
            first_counts[i],
            "stage {} row count changed on re-run",
            stage
        );
    }
    assert_eq!(count(&pool, "entity_unified").await, unified_first);
}

#[tokio::test]
async fn second_promotion_skips_every_duplicate() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_p8").await;
    run_stages(&config, &pool, "run_p8", 1, 16).await;

    let ctx = StageContext::new(&pool, &config, "run_p8".to_string(), StageOptions::default());
    let report = stages::stage_16_promotion::promote(&ctx).await.unwrap();
    assert_eq!(report.promoted_entities, 0);
    assert_eq!(report.skipped_duplicates, report.eligible_entities);
}

#[tokio::test]
async fn rollback_empties_the_run_and_rerun_restores_ids() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_s5").await;
    run_stages(&config, &pool, "run_s5", 1, 16).await;

    let mut before: Vec<String> = sqlx::query_scalar("SELECT entity_id FROM entity_unified")
        .fetch_all(&pool)
        .await
        .unwrap();
    before.sort();
    assert!(!before.is_empty());

    let outcome = rollback::rollback_with_pool(&pool, &config, 16, "run_s5", true)
        .await
        .unwrap();
    assert!(matches!(outcome, rollback::RollbackOutcome::Deleted(_)));
    assert_eq!(count_for_run(&pool, "entity_unified", "run_s5").await, 0);

    // Re-promotion restores the identical id set.
    let ctx = StageContext::new(&pool, &config, "run_s5".to_string(), StageOptions::default());
    stages::run_stage(&ctx, 16).await.unwrap();

    let mut after: Vec<String> = sqlx::query_scalar("SELECT entity_id FROM entity_unified")
        .fetch_all(&pool)
        .await
        .unwrap();
    after.sort();
    assert_eq!(before, after);
}

#[tokio::test]
async fn failed_validation_row_is_visible_and_never_promoted() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_s6").await;
    run_stages(&config, &pool, "run_s6", 1, 14).await;

    // Inject a row with a blank identity into the aggregate table.
    sqlx::query(
        r#"INSERT INTO claude_code_stage_14
           (entity_id, source_name, source_pipeline, level, text, word_count,
            session_id, created_at, run_id)
           VALUES ('', 'claude_code', 'claude_code_ingest', 5, 'orphan', 1,
                   'sess', '2024-01-01T00:00:00Z', 'run_s6')"#,
    )
    .execute(&pool)
    .await
    .unwrap();

    run_stages(&config, &pool, "run_s6", 15, 15).await;

    let failed = sqlx::query(
        "SELECT validation_status, validation_errors FROM claude_code_stage_15 WHERE entity_id = ''",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(
        failed.try_get::<String, _>("validation_status").unwrap(),
        "FAILED"
    );
    let errors: Vec<String> =
        serde_json::from_str(&failed.try_get::<String, _>("validation_errors").unwrap()).unwrap();
    assert!(!errors.is_empty());

    let unified_before = count(&pool, "entity_unified").await;
    run_stages(&config, &pool, "run_s6", 16, 16).await;

    let promoted_blank: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM entity_unified WHERE entity_id = ''")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(promoted_blank, 0);

    // Only the valid rows landed.
    let unified_after = count(&pool, "entity_unified").await;
    assert!(unified_after >= unified_before);
    let failed_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM entity_unified WHERE validation_status = 'FAILED'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(failed_count, 0);
}

#[tokio::test]
async fn sentence_word_counts_sum_to_message_counts() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(
        tmp.path(),
        "prose.jsonl",
        &[
            r#"{"type":"message","role":"user","content":"First sentence here. Second sentence too! A third?","timestamp":"2024-02-01T10:00:00Z"}"#,
            r#"{"type":"message","role":"assistant","content":"One reply. With two sentences.","timestamp":"2024-02-01T10:00:10Z"}"#,
        ],
    );

    discover(&config, &pool, "run_wc").await;
    run_stages(&config, &pool, "run_wc", 1, 7).await;

    let messages = sqlx::query("SELECT entity_id, word_count FROM claude_code_stage_7")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(!messages.is_empty());

    for row in messages {
        let entity_id: String = row.try_get("entity_id").unwrap();
        let message_words: i64 = row.try_get("word_count").unwrap();
        let sentence_words: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(word_count) FROM claude_code_stage_6 WHERE parent_id = ?",
        )
        .bind(&entity_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let sentence_words = sentence_words.unwrap_or(0);
        assert!(
            (sentence_words - message_words).abs() <= 1,
            "sentence words {} vs message words {}",
            sentence_words,
            message_words
        );
    }
}

#[tokio::test]
async fn reextraction_reproduces_fingerprints_and_identities() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    write_session(tmp.path(), "pair.jsonl", &[USER_HELLO, ASSISTANT_HI]);

    discover(&config, &pool, "run_a").await;
    run_stages(&config, &pool, "run_a", 1, 3).await;

    discover(&config, &pool, "run_b").await;
    run_stages(&config, &pool, "run_b", 1, 3).await;

    let ids_a: Vec<(String, String)> = sqlx::query_as(
        "SELECT entity_id, fingerprint FROM claude_code_stage_3 WHERE run_id = 'run_a' ORDER BY message_index",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    let ids_b: Vec<(String, String)> = sqlx::query_as(
        "SELECT entity_id, fingerprint FROM claude_code_stage_3 WHERE run_id = 'run_b' ORDER BY message_index",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn duplicate_messages_are_flagged_in_cleaning() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;
    // Identical content at different indexes yields different
    // fingerprints; a true duplicate needs the same index, which cannot
    // happen within one file. Simulate with two files whose first lines
    // coincide only in content, then confirm no false positives.
    write_session(tmp.path(), "one.jsonl", &[USER_HELLO, USER_HELLO]);

    discover(&config, &pool, "run_dup").await;
    run_stages(&config, &pool, "run_dup", 1, 2).await;

    let duplicates: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM claude_code_stage_2 WHERE is_duplicate = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    // Index participates in the fingerprint, so repeated text alone is
    // not a duplicate.
    assert_eq!(duplicates, 0);
}

#[tokio::test]
async fn missing_upstream_fails_with_guidance() {
    let tmp = TempDir::new().unwrap();
    let (config, pool) = setup(tmp.path()).await;

    let ctx = StageContext::new(&pool, &config, "run_none".to_string(), StageOptions::default());
    let err = stages::run_stage(&ctx, 2).await.unwrap_err().to_string();
    assert!(err.contains("What this means"));
    assert!(err.contains("What to do"));
    assert!(err.contains("claude_code_stage_1"));
}
