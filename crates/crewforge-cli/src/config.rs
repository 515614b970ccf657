//! `crewforge.toml` loading.

use anyhow::Context;
use crewforge_agent::ExecutorConfig;
use crewforge_orchestrator::CoordinatorConfig;
use serde::Deserialize;
use std::path::Path;

/// How a project is split into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Planner {
    /// Route requirements and deliverables by role vocabulary.
    #[default]
    Keyword,
    /// Ask the executor for a JSON plan, keyword routing as fallback.
    Executor,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrewforgeConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub planner: Planner,
}

impl CrewforgeConfig {
    /// Read `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file '{}'", path.display()))
            }
        };
        Self::parse(&raw).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crewforge_agent::ExecutorBackend;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CrewforgeConfig::parse("").unwrap();
        assert_eq!(config.coordinator.max_attempts, 2);
        assert_eq!(config.executor.backend, ExecutorBackend::Auto);
        assert_eq!(config.planner, Planner::Keyword);
    }

    #[test]
    fn test_full_config() {
        let config = CrewforgeConfig::parse(
            r#"
            planner = "executor"

            [coordinator]
            tick_interval_ms = 100
            run_timeout_secs = 600
            max_attempts = 3

            [executor]
            backend = "fallback"
            output_dir = "./generated"
            "#,
        )
        .unwrap();
        assert_eq!(config.planner, Planner::Executor);
        assert_eq!(config.coordinator.max_attempts, 3);
        assert_eq!(config.coordinator.run_timeout_secs, 600);
        assert_eq!(config.coordinator.task_timeout_secs, Some(900));
        assert_eq!(config.executor.backend, ExecutorBackend::Fallback);
    }

    #[test]
    fn test_unknown_planner_rejected() {
        assert!(CrewforgeConfig::parse(r#"planner = "magic""#).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CrewforgeConfig::load(&tmp.path().join("crewforge.toml"))
            .await
            .unwrap();
        assert_eq!(config.coordinator.tick_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("crewforge.toml");
        std::fs::write(&path, "[coordinator]\nmax_attempts = 5\n").unwrap();
        let config = CrewforgeConfig::load(&path).await.unwrap();
        assert_eq!(config.coordinator.max_attempts, 5);
    }
}
