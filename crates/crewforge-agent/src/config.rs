use crate::failover::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    /// Claude Code CLI first, deterministic fallback when it is unavailable.
    #[default]
    Auto,
    /// Use the local `claude` CLI in headless mode (-p --output-format json).
    /// Uses the existing Claude Code session; no API key needed.
    ClaudeCode,
    /// Deterministic minimal output only.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub backend: ExecutorBackend,
    #[serde(default = "default_claude_binary")]
    pub claude_binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Artificial delay for the fallback backend, in milliseconds.
    #[serde(default)]
    pub fallback_latency_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_claude_binary() -> String {
    "claude".to_string()
}

fn default_max_turns() -> u32 {
    10
}

fn default_permission_mode() -> String {
    "acceptEdits".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            claude_binary: default_claude_binary(),
            model: None,
            max_turns: default_max_turns(),
            permission_mode: default_permission_mode(),
            output_dir: default_output_dir(),
            fallback_latency_ms: 0,
            retry_policy: RetryPolicy::default(),
        }
    }
}
