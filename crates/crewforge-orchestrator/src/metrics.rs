use crate::bus::MessageBus;
use crate::registry::AgentRegistry;
use crate::types::{AgentStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use crewforge_core::Role;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Per-agent counters at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub role: Role,
    pub status: AgentStatus,
    pub completed: u32,
    pub failed: u32,
    pub busy_time_ms: u64,
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub timed_out: usize,
}

impl TaskCounts {
    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.blocked + self.timed_out
    }
}

/// Immutable point-in-time view of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tasks: TaskCounts,
    /// `completed / terminal`; 0 when nothing is terminal.
    pub completion_rate: f64,
    /// `busy agents / all agents`; 0 with no agents.
    pub utilization: f64,
    pub agents: Vec<AgentPerformance>,
    /// Messages published in the trailing window.
    pub message_throughput: usize,
    pub throughput_window_secs: u64,
    pub total_messages: usize,
    /// Failures that led to a re-dispatch.
    pub total_retries: u32,
}

/// Derives snapshots from tasks, the registry and the bus without mutating
/// any of them.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    throughput_window: Duration,
}

impl MetricsAggregator {
    pub fn new(throughput_window: Duration) -> Self {
        Self { throughput_window }
    }

    pub fn snapshot<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a Task>,
        registry: &AgentRegistry,
        bus: &MessageBus,
    ) -> MetricsSnapshot {
        self.snapshot_at(tasks, registry, bus, Utc::now())
    }

    pub fn snapshot_at<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a Task>,
        registry: &AgentRegistry,
        bus: &MessageBus,
        now: DateTime<Utc>,
    ) -> MetricsSnapshot {
        let mut counts = TaskCounts::default();
        let mut total_retries = 0;
        for task in tasks {
            counts.total += 1;
            total_retries += task.retries();
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Assigned | TaskStatus::InProgress => counts.in_flight += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::TimedOut => counts.timed_out += 1,
            }
        }

        let completion_rate = ratio(counts.completed, counts.terminal());
        let utilization = ratio(registry.busy_count(), registry.len());

        let agents = registry
            .agents()
            .iter()
            .map(|a| AgentPerformance {
                agent_id: a.id.clone(),
                role: a.role,
                status: a.status,
                completed: a.stats.completed,
                failed: a.stats.failed,
                busy_time_ms: a.stats.busy_time_ms,
            })
            .collect();

        let window = chrono::Duration::from_std(self.throughput_window)
            .unwrap_or_else(|_| chrono::Duration::zero());

        MetricsSnapshot {
            taken_at: now,
            tasks: counts,
            completion_rate,
            utilization,
            agents,
            message_throughput: bus.count_since(now - window),
            throughput_window_secs: self.throughput_window.as_secs(),
            total_messages: bus.len(),
            total_retries,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Bounded history of the most recent snapshots.
pub struct MetricsHistory {
    capacity: usize,
    entries: Mutex<VecDeque<MetricsSnapshot>>,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a snapshot, evicting the oldest when full.
    pub fn record(&self, snapshot: MetricsSnapshot) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(snapshot);
    }

    /// The last `limit` snapshots, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MetricsSnapshot> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.entries.lock().back().cloned()
    }

    /// Mean completion rate over the retained snapshots.
    pub fn average_completion_rate(&self) -> Option<f64> {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return None;
        }
        let sum: f64 = entries.iter().map(|s| s.completion_rate).sum();
        Some(sum / entries.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
