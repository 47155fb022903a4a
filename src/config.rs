use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Name of the hidden directory holding all run-scoped artifacts.
pub const ARE_DIR: &str = ".are";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub discover: DiscoverConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Worker count for Phase 1/2 pools. 0 = auto-size from cores and memory.
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub trace: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    /// Backend adapter name ("claude", "gemini") or "auto" for detection.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Child heap cap injected via the adapter's environment switch.
    #[serde(default = "default_memory_cap_mb")]
    pub memory_cap_mb: u64,
    /// Child internal thread-pool cap.
    #[serde(default = "default_thread_cap")]
    pub thread_cap: u32,
    /// Hard bound on captured stdout before the call fails as a parse error.
    #[serde(default = "default_stdout_cap")]
    pub stdout_cap_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Root-document targets, one artifact per supported assistant family.
    #[serde(default = "default_root_targets")]
    pub root_targets: Vec<String>,
    #[serde(default = "default_run_log_retention")]
    pub run_log_retention: usize,
    #[serde(default = "default_trace_retention")]
    pub trace_retention: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverConfig {
    #[serde(default = "default_vendor_dirs")]
    pub vendor_dirs: Vec<String>,
    #[serde(default = "default_binary_extensions")]
    pub binary_extensions: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_backend() -> String {
    "auto".to_string()
}
fn default_timeout_ms() -> u64 {
    120_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_memory_cap_mb() -> u64 {
    512
}
fn default_thread_cap() -> u32 {
    4
}
fn default_stdout_cap() -> usize {
    10 * 1024 * 1024
}
fn default_root_targets() -> Vec<String> {
    vec!["claude".to_string(), "agents".to_string()]
}
fn default_run_log_retention() -> usize {
    50
}
fn default_trace_retention() -> usize {
    500
}
fn default_vendor_dirs() -> Vec<String> {
    ["node_modules", "target", "vendor", "dist", "build", ".git"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_binary_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "gz", "xz", "zst", "tar", "jar", "so",
        "a", "o", "dylib", "dll", "exe", "bin", "woff", "woff2", "ttf", "mp4", "mp3", "lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            fail_fast: false,
            trace: false,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            memory_cap_mb: default_memory_cap_mb(),
            thread_cap: default_thread_cap(),
            stdout_cap_bytes: default_stdout_cap(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root_targets: default_root_targets(),
            run_log_retention: default_run_log_retention(),
            trace_retention: default_trace_retention(),
        }
    }
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            vendor_dirs: default_vendor_dirs(),
            binary_extensions: default_binary_extensions(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn get_xdg_config() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".config"))
                .ok()
        })
        .map(|p| p.join("aredoc/config.toml"))
}

/// Recursively merge two TOML values. For tables, overlay keys win;
/// missing keys are inherited from base. All other types (scalars, arrays)
/// are replaced wholesale by the overlay value.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    use toml::Value;
    match (base, overlay) {
        (Value::Table(mut base_map), Value::Table(overlay_map)) => {
            for (k, v) in overlay_map {
                let merged = if let Some(base_v) = base_map.remove(&k) {
                    merge_toml(base_v, v)
                } else {
                    v
                };
                base_map.insert(k, merged);
            }
            Value::Table(base_map)
        }
        (_, overlay) => overlay,
    }
}

fn load_toml_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::ConfigError(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

impl GlobalConfig {
    /// Load configuration with layered merging.
    ///
    /// When an explicit `path` is supplied (via `--config`), that single file
    /// is loaded as-is with no layering. Otherwise configs are merged in
    /// ascending priority order:
    ///
    ///   1. `$XDG_CONFIG_HOME/aredoc/config.toml` (per-user)
    ///   2. `<project>/aredoc.toml`               (project-local, highest)
    ///
    /// Missing layers are silently skipped; no file at all means defaults.
    pub fn load(path: Option<&Path>, project_root: &Path) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(EngineError::ConfigError(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            let config: Self = toml::from_str(&std::fs::read_to_string(p).map_err(|e| {
                EngineError::ConfigError(format!("failed to read {}: {}", p.display(), e))
            })?)?;
            config.validate()?;
            return Ok(config);
        }

        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(xdg) = get_xdg_config() {
            layers.push(xdg);
        }
        layers.push(project_root.join("aredoc.toml"));

        let mut merged: Option<toml::Value> = None;
        for layer_path in &layers {
            if layer_path.exists() {
                let val = load_toml_file(layer_path)?;
                merged = Some(match merged {
                    Some(base) => merge_toml(base, val),
                    None => val,
                });
            }
        }

        let config = match merged {
            None => Self::default(),
            Some(val) => GlobalConfig::deserialize(val)
                .map_err(|e| EngineError::ConfigError(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.concurrency > 20 {
            return Err(EngineError::ConfigError(format!(
                "concurrency must be within [1, 20] (or 0 for auto), got {}",
                self.engine.concurrency
            )));
        }
        for target in &self.output.root_targets {
            root_filename(target).ok_or_else(|| {
                EngineError::ConfigError(format!("unknown root target: {}", target))
            })?;
        }
        if self.ai.timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "ai.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count actually used by the pools.
    ///
    /// 0 means auto-size: cores x 5, clamped to [2, 20] and further bounded
    /// by how many 512 MiB children fit in half of total memory.
    pub fn effective_concurrency(&self) -> usize {
        if self.engine.concurrency != 0 {
            return self.engine.concurrency;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let mem_bound = total_memory_gib()
            .map(|gib| ((gib * 0.5) / 0.512).floor() as usize)
            .unwrap_or(20);
        (cores * 5).clamp(2, 20.min(mem_bound.max(2)))
    }
}

/// Total system memory in GiB, from /proc/meminfo.
fn total_memory_gib() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let kb: f64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some(kb / (1024.0 * 1024.0))
}

/// Filename of the root artifact for a given assistant family.
pub fn root_filename(target: &str) -> Option<&'static str> {
    match target {
        "claude" => Some("CLAUDE.md"),
        "agents" => Some("AGENTS.md"),
        "gemini" => Some("GEMINI.md"),
        _ => None,
    }
}

/// Filesystem layout of the run-scoped `.are/` directory.
#[derive(Debug, Clone)]
pub struct AreLayout {
    pub base: PathBuf,
}

impl AreLayout {
    pub fn new(project_root: &Path) -> Self {
        Self {
            base: project_root.join(ARE_DIR),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base.join("runs")
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.base.join("trace")
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.base.join("progress")
    }

    pub fn plan_file(&self) -> PathBuf {
        self.base.join("plan.md")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GlobalConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ai.timeout_ms, 120_000);
        assert_eq!(config.output.run_log_retention, 50);
        assert_eq!(config.output.trace_retention, 500);
    }

    #[test]
    fn concurrency_out_of_range_rejected() {
        let config: GlobalConfig = toml::from_str("[engine]\nconcurrency = 64\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_concurrency_within_bounds() {
        let config = GlobalConfig::default();
        let n = config.effective_concurrency();
        assert!((2..=20).contains(&n));
    }

    #[test]
    fn unknown_root_target_rejected() {
        let config: GlobalConfig =
            toml::from_str("[output]\nroot_targets = [\"copilot\"]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_concurrency_wins() {
        let config: GlobalConfig = toml::from_str("[engine]\nconcurrency = 7\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.effective_concurrency(), 7);
    }
}
