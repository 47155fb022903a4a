//! Per-call telemetry, the persisted run log, and the terminal run summary.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AreLayout;
use crate::error::{EngineError, Result};

/// A source file fed into a prompt as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub path: PathBuf,
    pub bytes: u64,
}

/// One record per AI call, accumulated across the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub label: String,
    pub started: String,
    pub ended: String,
    pub prompt_bytes: u64,
    pub response_bytes: u64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub retries: u32,
    /// Reasoning content, if an adapter ever surfaces it. Omitted, never a
    /// placeholder string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Files the engine fed into the prompt (not files the AI read itself).
    pub files: Vec<FileRef>,
}

/// Thread-safe accumulator shared by all workers.
#[derive(Default)]
pub struct TelemetrySink {
    entries: Mutex<Vec<TelemetryEntry>>,
}

impl TelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: TelemetryEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn snapshot(&self) -> Vec<TelemetryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

/// The run-log document persisted once at termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub command: String,
    pub started: String,
    pub ended: String,
    pub duration_ms: u64,
    pub files_processed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub totals: TokenTotals,
    pub entries: Vec<TelemetryEntry>,
}

/// Error detail carried into the summary for each failed task.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub label: String,
    pub kind: &'static str,
    pub message: String,
}

/// Terminal aggregate of a run; drives both user output and the exit class.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_processed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    /// Failed directory/root tasks; they affect the exit class but are not
    /// per-file counts.
    pub tasks_failed_other: usize,
    pub ai_calls: usize,
    pub totals: TokenTotals,
    pub duration_ms: u64,
    pub retries: u64,
    pub unique_files_read: usize,
    pub failures: Vec<FailureRecord>,
    pub validator_findings: Vec<String>,
}

impl RunSummary {
    /// 0 = full success, 1 = partial failure, 2 = total failure.
    pub fn exit_class(&self) -> i32 {
        if self.files_failed + self.tasks_failed_other == 0 {
            0
        } else if self.files_processed > 0 {
            1
        } else {
            2
        }
    }

    pub fn print(&self) {
        println!();
        println!("{}", "Run summary".bold());
        println!(
            "  processed {}  failed {}  skipped {}",
            self.files_processed.green(),
            if self.files_failed > 0 {
                self.files_failed.red().to_string()
            } else {
                self.files_failed.to_string()
            },
            self.files_skipped
        );
        println!(
            "  {} AI calls, {} retries, {} unique files read, {:.1}s",
            self.ai_calls,
            self.retries,
            self.unique_files_read,
            self.duration_ms as f64 / 1000.0
        );
        println!(
            "  tokens: {} in / {} out (cache: {} read, {} created)",
            self.totals.input,
            self.totals.output,
            self.totals.cache_read,
            self.totals.cache_creation
        );
        for failure in &self.failures {
            println!(
                "  {} [{}] {}: {}",
                "failed".red(),
                failure.kind,
                failure.label,
                failure.message
            );
        }
        for finding in &self.validator_findings {
            println!("  {} {}", "finding".yellow(), finding);
        }
    }
}

/// Aggregate telemetry entries into token totals.
pub fn sum_totals(entries: &[TelemetryEntry]) -> TokenTotals {
    let mut totals = TokenTotals::default();
    for entry in entries {
        totals.input += entry.input_tokens;
        totals.output += entry.output_tokens;
        totals.cache_read += entry.cache_read_tokens;
        totals.cache_creation += entry.cache_creation_tokens;
    }
    totals
}

/// Write the run log under `.are/runs/`, then prune to the newest N.
/// File names embed the start timestamp so lexicographic order is age order.
pub fn write_run_log(layout: &AreLayout, log: &RunLog, retention: usize) -> Result<PathBuf> {
    let runs = layout.runs_dir();
    std::fs::create_dir_all(&runs)?;
    let stamp = log.started.replace([':', '-'], "").replace('T', "-");
    let path = runs.join(format!(
        "run-{}-{}.json",
        stamp.trim_end_matches('Z'),
        std::process::id()
    ));
    let json = serde_json::to_string_pretty(log)?;
    std::fs::write(&path, json).map_err(|e| EngineError::WriteError {
        path: path.clone(),
        source: e,
    })?;
    prune_dir(&runs, "run-", retention);
    Ok(path)
}

/// Keep the newest `retention` files matching `prefix` in `dir`.
pub fn prune_dir(dir: &Path, prefix: &str, retention: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut names: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix))
                .unwrap_or(false)
        })
        .collect();
    names.sort();
    if names.len() <= retention {
        return;
    }
    let excess = names.len() - retention;
    for stale in names.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&stale) {
            warn!("failed to prune {}: {}", stale.display(), e);
        }
    }
}

/// Read persisted run logs, newest first. Unparseable files are skipped.
pub fn read_run_logs(layout: &AreLayout) -> Result<Vec<(PathBuf, RunLog)>> {
    let runs = layout.runs_dir();
    if !runs.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&runs)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths.reverse();

    let mut logs = Vec::new();
    for path in paths {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<RunLog>(&content) {
                Ok(log) => logs.push((path, log)),
                Err(e) => warn!("skipping unreadable run log {}: {}", path.display(), e),
            },
            Err(e) => warn!("skipping unreadable run log {}: {}", path.display(), e),
        }
    }
    Ok(logs)
}

/// The `summary` operation: tabulate run logs, or dump them as JSON.
pub fn print_run_logs(layout: &AreLayout, json: bool) -> Result<()> {
    let logs = read_run_logs(layout)?;
    if json {
        let docs: Vec<&RunLog> = logs.iter().map(|(_, l)| l).collect();
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }
    if logs.is_empty() {
        println!("no runs recorded under {}", layout.runs_dir().display());
        return Ok(());
    }
    println!(
        "{:<22} {:<10} {:>6} {:>6} {:>6} {:>10} {:>10} {:>8}",
        "started", "command", "ok", "fail", "skip", "tok-in", "tok-out", "secs"
    );
    for (_, log) in &logs {
        println!(
            "{:<22} {:<10} {:>6} {:>6} {:>6} {:>10} {:>10} {:>8.1}",
            log.started,
            log.command,
            log.files_processed,
            log.files_failed,
            log.files_skipped,
            log.totals.input,
            log.totals.output,
            log.duration_ms as f64 / 1000.0
        );
    }
    Ok(())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
