pub mod claude_code;
pub mod fallback;

pub use claude_code::ClaudeCodeExecutor;
pub use fallback::FallbackExecutor;

use crate::config::{ExecutorBackend, ExecutorConfig};
use crate::executor::TaskExecutor;
use crate::failover::FailoverExecutor;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::info;

/// True when `relative` stays under the output directory: no absolute paths,
/// no parent-directory escapes.
pub(crate) fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Build the executor selected by `config.backend`.
///
/// `Auto` chains the Claude Code CLI with the deterministic fallback, so a
/// missing `claude` binary degrades to minimal output instead of failing
/// every task.
pub fn build_executor(config: &ExecutorConfig) -> Arc<dyn TaskExecutor> {
    info!(backend = ?config.backend, output_dir = %config.output_dir.display(), "Building task executor");
    match config.backend {
        ExecutorBackend::ClaudeCode => Arc::new(ClaudeCodeExecutor::new(config.clone())),
        ExecutorBackend::Fallback => Arc::new(FallbackExecutor::from_config(config)),
        ExecutorBackend::Auto => Arc::new(FailoverExecutor::new(
            vec![
                Box::new(ClaudeCodeExecutor::new(config.clone())),
                Box::new(FallbackExecutor::from_config(config)),
            ],
            config.retry_policy.clone(),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_executor_names() {
        let mut config = ExecutorConfig::default();
        config.backend = ExecutorBackend::Fallback;
        assert_eq!(build_executor(&config).name(), "fallback");

        config.backend = ExecutorBackend::ClaudeCode;
        assert_eq!(build_executor(&config).name(), "claude_code");

        config.backend = ExecutorBackend::Auto;
        assert_eq!(build_executor(&config).name(), "failover");
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained("main.py"));
        assert!(is_contained("./web/index.html"));
        assert!(!is_contained(""));
        assert!(!is_contained("../outside.py"));
        assert!(!is_contained("web/../../outside.py"));
        assert!(!is_contained("/etc/passwd"));
    }
}
