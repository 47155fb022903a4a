//! Backend adapters, one per supported AI CLI family.
//!
//! An adapter is the only place that knows a backend's wire format: how to
//! probe for the binary, build the argument vector, shape the stdin payload,
//! cap the child's resources through environment switches, and parse its
//! stdout. The engine never looks inside any of that.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Normalized response, independent of which CLI produced it.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub raw: String,
}

/// Resource caps injected into every child. The env var names are
/// adapter-specific; the three semantics are contractual.
#[derive(Debug, Clone, Copy)]
pub struct ChildCaps {
    pub memory_cap_mb: u64,
    pub thread_cap: u32,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn program(&self) -> String;
    fn build_args(&self, prompts: &PromptPair) -> Vec<String>;
    fn env_overrides(&self, caps: &ChildCaps) -> Vec<(String, String)>;
    fn parse_response(&self, stdout: &str) -> Result<AiResponse>;
    fn install_hint(&self) -> &'static str;

    fn is_available(&self) -> bool {
        find_in_path(&self.program()).is_some()
    }

    /// What the driver writes to the child's stdin.
    fn stdin_payload(&self, prompts: &PromptPair) -> String {
        prompts.user.clone()
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

/// Resolve a program name against PATH (or accept an explicit path).
fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Claude Code CLI
// ---------------------------------------------------------------------------

pub struct ClaudeBackend;

#[derive(Deserialize, Default)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize)]
struct ClaudeJson {
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    usage: ClaudeUsage,
    #[serde(default, rename = "modelUsage")]
    model_usage: BTreeMap<String, serde_json::Value>,
}

impl Backend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn program(&self) -> String {
        "claude".to_string()
    }

    fn build_args(&self, prompts: &PromptPair) -> Vec<String> {
        vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--append-system-prompt".to_string(),
            prompts.system.clone(),
            "--max-turns".to_string(),
            "1".to_string(),
        ]
    }

    fn env_overrides(&self, caps: &ChildCaps) -> Vec<(String, String)> {
        vec![
            // Heap cap for the Node runtime the CLI runs on.
            (
                "NODE_OPTIONS".to_string(),
                format!("--max-old-space-size={}", caps.memory_cap_mb),
            ),
            // libuv worker-pool cap.
            ("UV_THREADPOOL_SIZE".to_string(), caps.thread_cap.to_string()),
            // Keep the child from spawning its own background work.
            (
                "CLAUDE_CODE_DISABLE_BACKGROUND_TASKS".to_string(),
                "1".to_string(),
            ),
        ]
    }

    fn parse_response(&self, stdout: &str) -> Result<AiResponse> {
        let parsed: ClaudeJson = serde_json::from_str(stdout).map_err(|e| {
            EngineError::ParseError(format!("claude output is not valid JSON: {}", e))
        })?;
        if parsed.is_error {
            return Err(EngineError::ParseError(
                "claude reported an error result".to_string(),
            ));
        }
        let text = parsed.result.ok_or_else(|| {
            EngineError::ParseError("claude output missing 'result' field".to_string())
        })?;
        let model = parsed
            .model_usage
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(AiResponse {
            text,
            model,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_tokens: parsed.usage.cache_read_input_tokens,
            cache_creation_tokens: parsed.usage.cache_creation_input_tokens,
            duration_ms: parsed.duration_ms,
            exit_code: 0,
            raw: stdout.to_string(),
        })
    }

    fn install_hint(&self) -> &'static str {
        "claude: npm install -g @anthropic-ai/claude-code"
    }
}

// ---------------------------------------------------------------------------
// Gemini CLI
// ---------------------------------------------------------------------------

pub struct GeminiBackend;

#[derive(Deserialize, Default)]
struct GeminiTokens {
    #[serde(default)]
    prompt: u64,
    #[serde(default)]
    candidates: u64,
    #[serde(default)]
    cached: u64,
}

#[derive(Deserialize, Default)]
struct GeminiModelStats {
    #[serde(default)]
    tokens: GeminiTokens,
}

#[derive(Deserialize, Default)]
struct GeminiStats {
    #[serde(default)]
    models: BTreeMap<String, GeminiModelStats>,
}

#[derive(Deserialize)]
struct GeminiJson {
    response: Option<String>,
    #[serde(default)]
    stats: GeminiStats,
}

impl Backend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn program(&self) -> String {
        "gemini".to_string()
    }

    fn build_args(&self, _prompts: &PromptPair) -> Vec<String> {
        vec!["-o".to_string(), "json".to_string()]
    }

    // The Gemini CLI has no separate system-prompt channel; fold both
    // prompts into the stdin payload.
    fn stdin_payload(&self, prompts: &PromptPair) -> String {
        format!("{}\n\n{}", prompts.system, prompts.user)
    }

    fn env_overrides(&self, caps: &ChildCaps) -> Vec<(String, String)> {
        vec![
            (
                "NODE_OPTIONS".to_string(),
                format!("--max-old-space-size={}", caps.memory_cap_mb),
            ),
            ("UV_THREADPOOL_SIZE".to_string(), caps.thread_cap.to_string()),
            ("GEMINI_CLI_NO_AUTO_UPDATE".to_string(), "1".to_string()),
        ]
    }

    fn parse_response(&self, stdout: &str) -> Result<AiResponse> {
        let parsed: GeminiJson = serde_json::from_str(stdout).map_err(|e| {
            EngineError::ParseError(format!("gemini output is not valid JSON: {}", e))
        })?;
        let text = parsed.response.ok_or_else(|| {
            EngineError::ParseError("gemini output missing 'response' field".to_string())
        })?;
        let (model, tokens) = parsed
            .stats
            .models
            .into_iter()
            .next()
            .map(|(name, stats)| (name, stats.tokens))
            .unwrap_or_else(|| ("unknown".to_string(), GeminiTokens::default()));
        Ok(AiResponse {
            text,
            model,
            input_tokens: tokens.prompt,
            output_tokens: tokens.candidates,
            cache_read_tokens: tokens.cached,
            cache_creation_tokens: 0,
            duration_ms: 0,
            exit_code: 0,
            raw: stdout.to_string(),
        })
    }

    fn install_hint(&self) -> &'static str {
        "gemini: npm install -g @google/gemini-cli"
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

pub fn registry() -> Vec<Arc<dyn Backend>> {
    vec![Arc::new(ClaudeBackend), Arc::new(GeminiBackend)]
}

fn all_hints() -> String {
    registry()
        .iter()
        .map(|b| format!("  {}", b.install_hint()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Select a backend by configured name, or auto-detect (registry order,
/// first available wins). Fails before any task runs when nothing usable
/// is installed.
pub fn select(name: &str) -> Result<Arc<dyn Backend>> {
    if name == "auto" {
        return registry()
            .into_iter()
            .find(|b| b.is_available())
            .ok_or_else(|| EngineError::CliNotFound { hints: all_hints() });
    }
    let backend = registry()
        .into_iter()
        .find(|b| b.name() == name)
        .ok_or_else(|| EngineError::ConfigError(format!("unknown AI backend: {}", name)))?;
    if !backend.is_available() {
        return Err(EngineError::CliNotFound {
            hints: format!("  {}", backend.install_hint()),
        });
    }
    Ok(backend)
}
