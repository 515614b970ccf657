//! Multi-agent task coordination engine.
//!
//! Decomposes a project into a dependency graph of tasks, dispatches ready
//! tasks to idle capability-matched agents, retries failures up to a bound,
//! propagates terminal failures to dependents and reports progress through an
//! ordered message log and metrics snapshots.
//!
//! # Main types
//!
//! - [`Coordinator`] — Submission API: start/stop, submit projects, wait, observe.
//! - [`TaskGraph`] — Dependency DAG with status transitions and blocked propagation.
//! - [`AgentRegistry`] — Agents, capability tags and load-balanced idle lookup.
//! - [`MessageBus`] — Append-only, totally ordered message log with a live feed.
//! - [`Dispatcher`] — Per-run loop that drains ready tasks onto idle agents.
//! - [`MetricsAggregator`] — Read-only snapshots of tasks, agents and throughput.
//! - [`Decomposer`] — Turns a [`ProjectSpec`] into a task graph.

/// Ordered message log and live feed.
pub mod bus;
/// Coordinator tunables.
pub mod config;
/// Submission API over registry, bus and runs.
pub mod coordinator;
/// Project decomposition strategies.
pub mod decomposer;
/// Per-run scheduling loop.
pub mod dispatcher;
/// Metrics snapshots and bounded history.
pub mod metrics;
/// Agent registry.
pub mod registry;
/// Task dependency graph.
pub mod task_graph;
/// Shared coordination types (Task, Agent, statuses).
pub mod types;

pub use bus::{Endpoint, Message, MessageBus, MessageKind};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, RunReport, RunSummary, SystemStatus};
pub use decomposer::{
    parse_plan, Decomposer, ExecutorPlanDecomposer, KeywordDecomposer, ProjectSpec,
};
pub use dispatcher::Dispatcher;
pub use metrics::{AgentPerformance, MetricsAggregator, MetricsHistory, MetricsSnapshot, TaskCounts};
pub use registry::AgentRegistry;
pub use task_graph::TaskGraph;
pub use types::{
    Agent, AgentStats, AgentStatus, MarkEffect, ReleaseOutcome, RunStatus, Task, TaskOutcome,
    TaskResult, TaskStatus,
};
