use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("discovery error: {0}")]
    DiscoveryError(String),

    #[error("no AI backend available:\n{hints}")]
    CliNotFound { hints: String },

    #[error("AI call timed out after {timeout_ms} ms: {label}")]
    Timeout { label: String, timeout_ms: u64 },

    #[error("failed to parse AI response: {0}")]
    ParseError(String),

    #[error("AI subprocess exited with {exit_code}: {stderr}")]
    SubprocessError { exit_code: i32, stderr: String },

    #[error("rate limit still hit after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("failed to write {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("dependency artifacts missing for {task}: {missing:?}")]
    DependencyMissing { task: String, missing: Vec<PathBuf> },

    #[error("task skipped: pool aborted before pickup")]
    Skipped,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EngineError {
    /// Machine-readable tag used in the progress log, run summary and trace.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config",
            Self::DiscoveryError(_) => "discovery",
            Self::CliNotFound { .. } => "cli-not-found",
            Self::Timeout { .. } => "ai-timeout",
            Self::ParseError(_) => "ai-parse",
            Self::SubprocessError { .. } => "ai-subprocess",
            Self::RateLimitExhausted { .. } => "rate-limit-exhausted",
            Self::WriteError { .. } => "write",
            Self::DependencyMissing { .. } => "dependency-missing",
            Self::Skipped => "skipped",
            Self::IoError(_) => "io",
            Self::TomlError(_) => "config",
            Self::JsonError(_) => "ai-parse",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
