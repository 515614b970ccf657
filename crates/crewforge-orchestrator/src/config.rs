use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the coordination engine, loaded from the `[coordinator]`
/// table of `crewforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Scheduling tick while tasks wait for an idle agent.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Global deadline for one run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Per-task executor timeout, always capped by the remaining run budget.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: Option<u64>,
    /// Executor invocations per task before it fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_metrics_history_size")]
    pub metrics_history_size: usize,
    /// Trailing window for message throughput.
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    /// Record a metrics snapshot on this interval while the system runs.
    #[serde(default)]
    pub metrics_interval_secs: Option<u64>,
    /// How far a bus subscriber may lag before missing messages.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_run_timeout_secs() -> u64 {
    3600
}

fn default_task_timeout_secs() -> Option<u64> {
    Some(900)
}

fn default_max_attempts() -> u32 {
    2
}

fn default_metrics_history_size() -> usize {
    100
}

fn default_throughput_window_secs() -> u64 {
    60
}

fn default_bus_capacity() -> usize {
    256
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_attempts: default_max_attempts(),
            metrics_history_size: default_metrics_history_size(),
            throughput_window_secs: default_throughput_window_secs(),
            metrics_interval_secs: None,
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// `None` or zero disables the per-task limit.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        self.metrics_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
