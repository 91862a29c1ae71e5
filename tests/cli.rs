//! CLI surface tests: drive the compiled `loom` binary end to end in a
//! scratch environment, the way an operator would.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn loom_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("loom");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("sessions")).unwrap();

    fs::write(
        root.join("sessions/alpha.jsonl"),
        concat!(
            r#"{"type":"message","role":"user","content":"How do I sort a vec in rust? It keeps failing.","timestamp":"2024-03-01T09:00:00Z"}"#,
            "\n",
            r#"{"type":"message","role":"assistant","content":"Call sort on the vec. For custom keys, use sort_by_key.","timestamp":"2024-03-01T09:00:04Z"}"#,
        ),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/loom.sqlite"

[source]
name = "claude_code"
root = "{root}/sessions"

[pipeline]
batch_size = 500
sentence_level = 4

[sentiment]
provider = "lexicon"
"#,
        root = root.display()
    );

    let config_path = root.join("config/loom.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_loom(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = loom_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run loom binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Pull the run id out of `loom discover` output.
fn discover_run_id(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_loom(config_path, &["discover"]);
    assert!(success, "discover failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("verdict:  GO"), "unexpected verdict: {}", stdout);
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("run:"))
        .map(|s| s.trim().to_string())
        .expect("discover output names the run id")
}

#[test]
fn init_creates_database_and_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_loom(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_loom(&config_path, &["init"]);
    assert!(success2, "second init failed (not idempotent)");
}

#[test]
fn full_pipeline_promotes_and_verifies() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let run_id = discover_run_id(&config_path);

    let (stdout, stderr, success) =
        run_loom(&config_path, &["pipeline", "--run-id", &run_id]);
    assert!(success, "pipeline failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("stage 16"));
    assert!(stdout.contains("ok"));

    // Every stage passes verification for this run.
    for stage in ["0", "1", "3", "5", "6", "7", "13", "15", "16"] {
        let (stdout, stderr, success) =
            run_loom(&config_path, &["verify", stage, "--run-id", &run_id]);
        assert!(
            success,
            "verify {} failed: stdout={}, stderr={}",
            stage, stdout, stderr
        );
        assert!(stdout.trim().ends_with("ok"));
    }

    let (stdout, _, success) = run_loom(&config_path, &["status", "--run-id", &run_id]);
    assert!(success);
    assert!(stdout.contains("entity_unified"));
}

#[test]
fn verify_exits_nonzero_for_missing_run() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let (stdout, _, success) =
        run_loom(&config_path, &["verify", "7", "--run-id", "run_missing"]);
    assert!(!success, "verify should fail for an unknown run");
    assert!(stdout.contains("What this means"));
    assert!(stdout.contains("What to do"));
}

#[test]
fn run_requires_a_valid_run_id() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let (_, stderr, success) =
        run_loom(&config_path, &["run", "2", "--run-id", "bad run id"]);
    assert!(!success);
    assert!(stderr.contains("invalid characters"));
}

#[test]
fn rollback_lists_runs_and_deletes_with_confirm() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let run_id = discover_run_id(&config_path);
    let (_, _, success) = run_loom(&config_path, &["pipeline", "--run-id", &run_id]);
    assert!(success);

    let (stdout, _, success) = run_loom(&config_path, &["rollback", "7", "--list-runs"]);
    assert!(success);
    assert!(stdout.contains(&run_id));

    let (stdout, stderr, success) = run_loom(
        &config_path,
        &["rollback", "16", "--run-id", &run_id, "--confirm"],
    );
    assert!(success, "rollback failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("deleted"));

    // The canonical table no longer carries the run.
    let (stdout, _, success) =
        run_loom(&config_path, &["verify", "16", "--run-id", &run_id]);
    assert!(!success, "verify 16 should fail after rollback: {}", stdout);
}

#[test]
fn rollback_without_run_id_is_refused() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let (_, stderr, success) = run_loom(&config_path, &["rollback", "7"]);
    assert!(!success);
    // clap enforces the flag before any SQL can run.
    assert!(stderr.contains("--run-id") || stderr.contains("required"));
}

#[test]
fn dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();

    run_loom(&config_path, &["init"]);
    let run_id = discover_run_id(&config_path);

    let (stdout, _, success) = run_loom(
        &config_path,
        &["run", "1", "--run-id", &run_id, "--dry-run"],
    );
    assert!(success, "dry run failed: {}", stdout);

    // A real run afterwards still extracts everything, so the dry run
    // left no rows behind.
    let (_, _, success) = run_loom(&config_path, &["run", "1", "--run-id", &run_id]);
    assert!(success);
    let (stdout, _, _) = run_loom(&config_path, &["verify", "1", "--run-id", &run_id]);
    assert!(stdout.contains("rows: 2"));
}

#[test]
fn no_go_source_blocks_extraction() {
    let (tmp, config_path) = setup_test_env();

    // Replace the session with an empty file: no messages, NO_GO.
    fs::write(tmp.path().join("sessions/alpha.jsonl"), "").unwrap();

    run_loom(&config_path, &["init"]);
    let (stdout, _, success) = run_loom(&config_path, &["discover"]);
    assert!(success);
    assert!(stdout.contains("NO_GO(no_messages)"));
    assert!(stdout.contains("no-go"));

    let run_id = stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("run:"))
        .map(|s| s.trim().to_string())
        .unwrap();

    let (_, stderr, success) = run_loom(&config_path, &["run", "1", "--run-id", &run_id]);
    assert!(!success);
    assert!(stderr.contains("NO_GO"));
}
