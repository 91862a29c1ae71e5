//! Stage 0: discovery.
//!
//! Enumerates raw `*.jsonl` session files under the configured source
//! root, samples each file for parseability, and emits a manifest with a
//! go/no-go verdict. Fails closed: a missing directory, an empty
//! directory, zero messages, or too many malformed lines all produce
//! NO_GO, and downstream stages refuse to start.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;
use walkdir::WalkDir;

use crate::textutil::now_utc;

use super::StageContext;

/// Lines sampled per file during preflight.
const PREFLIGHT_SAMPLE_LINES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<String>,
    pub sampled_lines: u64,
    pub malformed_lines: u64,
    pub message_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub source_name: String,
    pub generated_at: String,
    pub file_count: u64,
    pub total_size: u64,
    pub message_count: u64,
    pub go_no_go: String,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn is_go(&self) -> bool {
        self.go_no_go == "GO"
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn sample_file(path: &Path) -> Result<(u64, u64, u64)> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut sampled = 0u64;
    let mut malformed = 0u64;
    let mut messages = 0u64;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if sampled >= PREFLIGHT_SAMPLE_LINES as u64 {
            break;
        }
        sampled += 1;
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) => {
                if value.get("type").and_then(|t| t.as_str()) == Some("message") {
                    messages += 1;
                }
            }
            Err(_) => malformed += 1,
        }
    }

    Ok((sampled, malformed, messages))
}

/// Build the manifest for a run and persist it (JSON file + stage_0 row).
pub async fn run(ctx: &StageContext<'_>) -> Result<Manifest> {
    let root = &ctx.config.source.root;
    let generated_at = now_utc();

    let mut files = Vec::new();
    let mut verdict: Option<String> = None;

    if !root.exists() {
        verdict = Some(format!("NO_GO(missing_directory:{})", root.display()));
    } else {
        let include = build_globset(&ctx.config.source.include_globs)?;
        let exclude = build_globset(&ctx.config.source.exclude_globs)?;

        let mut paths: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                let rel = p.strip_prefix(root).unwrap_or(p);
                include.is_match(rel) && !exclude.is_match(rel)
            })
            .collect();
        paths.sort();

        for path in paths {
            let meta = std::fs::metadata(&path)?;
            let modified_at = meta
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
            let (sampled, malformed, messages) = sample_file(&path)?;
            files.push(ManifestFile {
                path: path.display().to_string(),
                size_bytes: meta.len(),
                modified_at,
                sampled_lines: sampled,
                malformed_lines: malformed,
                message_lines: messages,
            });
        }
    }

    let file_count = files.len() as u64;
    let total_size: u64 = files.iter().map(|f| f.size_bytes).sum();
    let message_count: u64 = files.iter().map(|f| f.message_lines).sum();
    let sampled: u64 = files.iter().map(|f| f.sampled_lines).sum();
    let malformed: u64 = files.iter().map(|f| f.malformed_lines).sum();

    let go_no_go = verdict.unwrap_or_else(|| {
        if file_count == 0 {
            "NO_GO(no_files)".to_string()
        } else if message_count == 0 {
            "NO_GO(no_messages)".to_string()
        } else if sampled > 0
            && (malformed as f64 / sampled as f64) > ctx.config.pipeline.preflight_malformed_threshold
        {
            format!("NO_GO(malformed_ratio:{}/{})", malformed, sampled)
        } else {
            "GO".to_string()
        }
    });

    let manifest = Manifest {
        run_id: ctx.run_id.clone(),
        source_name: ctx.source().to_string(),
        generated_at: generated_at.clone(),
        file_count,
        total_size,
        message_count,
        go_no_go,
        files,
    };

    info!(
        run_id = %ctx.run_id,
        files = file_count,
        verdict = %manifest.go_no_go,
        "discovery complete"
    );

    if ctx.opts.dry_run {
        return Ok(manifest);
    }

    let manifest_path = write_manifest_file(ctx, &manifest)?;

    sqlx::query(&format!(
        r#"
        INSERT OR IGNORE INTO {}
        (run_id, source_name, manifest_path, file_count, total_size,
         message_count, go_no_go, created_at, valid_time, system_time, valid_to)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
        ctx.table(0)?
    ))
    .bind(&manifest.run_id)
    .bind(&manifest.source_name)
    .bind(&manifest_path)
    .bind(manifest.file_count as i64)
    .bind(manifest.total_size as i64)
    .bind(manifest.message_count as i64)
    .bind(&manifest.go_no_go)
    .bind(&generated_at)
    .bind(&generated_at)
    .bind(&generated_at)
    .execute(ctx.pool)
    .await?;

    Ok(manifest)
}

fn write_manifest_file(ctx: &StageContext<'_>, manifest: &Manifest) -> Result<String> {
    let dir = ctx
        .config
        .pipeline
        .manifest_dir
        .clone()
        .or_else(|| ctx.config.db.path.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!("manifest_{}.json", manifest.run_id));
    std::fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
    Ok(path.display().to_string())
}

/// Load the manifest recorded for a run; stage 1's input.
pub async fn load_manifest(ctx: &StageContext<'_>) -> Result<Manifest> {
    let row: Option<(String, String)> = sqlx::query_as(&format!(
        "SELECT manifest_path, go_no_go FROM {} WHERE run_id = ?",
        ctx.table(0)?
    ))
    .bind(&ctx.run_id)
    .fetch_optional(ctx.pool)
    .await?;

    let (path, _) = row.ok_or_else(|| {
        anyhow::anyhow!(
            "No manifest for run '{}'.\n  What this means: discovery (stage 0) has not run for this run id.\n  What to do: run `loom discover --run-id {}` first.",
            ctx.run_id,
            ctx.run_id,
        )
    })?;

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read manifest file: {}", path))?;
    let manifest: Manifest = serde_json::from_str(&content)?;
    Ok(manifest)
}
