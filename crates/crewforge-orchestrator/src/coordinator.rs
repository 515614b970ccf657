use crate::bus::{Message, MessageBus};
use crate::config::CoordinatorConfig;
use crate::decomposer::{Decomposer, KeywordDecomposer, ProjectSpec};
use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricsAggregator, MetricsHistory, MetricsSnapshot};
use crate::registry::AgentRegistry;
use crate::task_graph::TaskGraph;
use crate::types::{Agent, RunStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use crewforge_agent::{Artifact, TaskExecutor};
use crewforge_core::{CrewforgeError, CrewforgeResult, Role};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Live state of one submitted project.
struct RunHandle {
    project: ProjectSpec,
    graph: Arc<RwLock<TaskGraph>>,
    status: watch::Receiver<RunStatus>,
    started_at: DateTime<Utc>,
    finished_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    dispatcher: Option<JoinHandle<RunStatus>>,
}

/// Present while the system is started.
struct Lifecycle {
    stop: watch::Sender<bool>,
    sampler: Option<JoinHandle<()>>,
}

type RunTable = Arc<RwLock<HashMap<Uuid, RunHandle>>>;

/// One row of [`SystemStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub description: String,
    pub status: RunStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub running: bool,
    pub agents: usize,
    pub busy_agents: usize,
    pub total_messages: usize,
    /// Oldest first.
    pub runs: Vec<RunSummary>,
}

/// Outcome of a run: every task plus the artifacts of the completed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub project: ProjectSpec,
    pub summary: String,
    pub tasks: Vec<Task>,
    pub artifacts: Vec<Artifact>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

/// The submission API. Owns the agent registry, the message bus, the metrics
/// history and every run started through it.
///
/// Runs share the registry and the bus; each has its own task graph and
/// dispatcher loop.
pub struct Coordinator {
    config: CoordinatorConfig,
    executor: Arc<dyn TaskExecutor>,
    decomposer: Arc<dyn Decomposer>,
    registry: Arc<RwLock<AgentRegistry>>,
    bus: Arc<MessageBus>,
    aggregator: MetricsAggregator,
    history: Arc<MetricsHistory>,
    runs: RunTable,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Coordinator {
    /// Create a coordinator with one agent per role: `project_manager`,
    /// `frontend_coder`, `backend_coder` and `devops_coder`.
    pub fn new(config: CoordinatorConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let mut registry = AgentRegistry::new();
        for role in Role::ALL {
            if let Err(e) = registry.register(Agent::for_role(role)) {
                warn!(role = %role, error = %e, "Default agent not registered");
            }
        }

        Self {
            aggregator: MetricsAggregator::new(config.throughput_window()),
            history: Arc::new(MetricsHistory::new(config.metrics_history_size)),
            bus: Arc::new(MessageBus::new(config.bus_capacity)),
            registry: Arc::new(RwLock::new(registry)),
            decomposer: Arc::new(KeywordDecomposer::new()),
            runs: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: Mutex::new(None),
            executor,
            config,
        }
    }

    /// Replace the decomposition strategy.
    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    /// Replace the default roster.
    pub fn with_agents(mut self, agents: Vec<Agent>) -> CrewforgeResult<Self> {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(agent)?;
        }
        self.registry = Arc::new(RwLock::new(registry));
        Ok(self)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Accept submissions. Starts the metrics sampler when
    /// `metrics_interval_secs` is set. Starting twice is a no-op.
    pub fn start_system(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return;
        }
        let (stop, _) = watch::channel(false);
        let sampler = self
            .config
            .metrics_interval()
            .map(|interval| self.spawn_sampler(interval, stop.subscribe()));
        info!(
            metrics_interval_secs = ?self.config.metrics_interval_secs,
            "Coordinator: system started"
        );
        *lifecycle = Some(Lifecycle { stop, sampler });
    }

    /// Stop every run, wait for their dispatchers and stop the sampler.
    ///
    /// Tasks that were in flight go back to `Pending`; graphs stay available
    /// through [`Coordinator::run_report`].
    pub async fn stop_system(&self) {
        let Some(lifecycle) = self.lifecycle.lock().take() else {
            return;
        };
        lifecycle.stop.send_replace(true);

        let dispatchers: Vec<(Uuid, JoinHandle<RunStatus>)> = {
            let mut runs = self.runs.write().await;
            runs.iter_mut()
                .filter_map(|(id, run)| run.dispatcher.take().map(|handle| (*id, handle)))
                .collect()
        };
        for (run_id, handle) in dispatchers {
            match handle.await {
                Ok(status) => debug!(run_id = %run_id, %status, "Dispatcher joined"),
                Err(e) => error!(run_id = %run_id, error = %e, "Dispatcher task failed"),
            }
        }

        if let Some(sampler) = lifecycle.sampler {
            if let Err(e) = sampler.await {
                error!(error = %e, "Metrics sampler failed");
            }
        }
        info!("Coordinator: system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Decompose a project without running it.
    pub async fn plan(&self, project: &ProjectSpec) -> CrewforgeResult<TaskGraph> {
        self.decomposer
            .decompose(project, self.config.max_attempts)
            .await
    }

    /// Decompose `project` and start a dispatcher for it.
    ///
    /// Fails with [`CrewforgeError::NotRunning`] before `start_system`, and
    /// with the integrity error when the plan is not a valid graph.
    pub async fn submit_project_task(&self, project: ProjectSpec) -> CrewforgeResult<Uuid> {
        if !self.is_running() {
            return Err(CrewforgeError::NotRunning);
        }

        let graph = self.plan(&project).await?;
        let run_id = Uuid::new_v4();

        // Subscribe and register under the run table lock, so a concurrent
        // stop_system either rejects this run or joins its dispatcher.
        let mut runs = self.runs.write().await;
        let stop = self
            .lifecycle
            .lock()
            .as_ref()
            .map(|l| l.stop.subscribe())
            .ok_or(CrewforgeError::NotRunning)?;
        info!(
            run_id = %run_id,
            decomposer = self.decomposer.name(),
            tasks = graph.len(),
            "Coordinator: project submitted"
        );

        let graph = Arc::new(RwLock::new(graph));
        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let finished_at = Arc::new(Mutex::new(None));
        let dispatcher = Dispatcher::new(
            run_id,
            graph.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.executor.clone(),
        )
        .with_config(&self.config);

        let finished = finished_at.clone();
        let handle = tokio::spawn(async move {
            let status = dispatcher.run(stop).await;
            *finished.lock() = Some(Utc::now());
            status_tx.send_replace(status);
            status
        });

        runs.insert(
            run_id,
            RunHandle {
                project,
                graph,
                status: status_rx,
                started_at: Utc::now(),
                finished_at,
                dispatcher: Some(handle),
            },
        );
        Ok(run_id)
    }

    /// Wait up to `timeout` for a run to finish.
    ///
    /// Returns the run status at that point, which is still
    /// [`RunStatus::Running`] if the wait timed out.
    pub async fn wait_for_completion(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> CrewforgeResult<RunStatus> {
        let mut status = self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|run| run.status.clone())
            .ok_or(CrewforgeError::RunNotFound(run_id))?;

        let finished = tokio::time::timeout(timeout, async {
            status
                .wait_for(|s| s.is_finished())
                .await
                .map(|s| *s)
                .ok()
        })
        .await;

        Ok(match finished {
            Ok(Some(done)) => done,
            _ => *status.borrow(),
        })
    }

    /// Current status of a run.
    pub async fn run_status(&self, run_id: Uuid) -> CrewforgeResult<RunStatus> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(|run| *run.status.borrow())
            .ok_or(CrewforgeError::RunNotFound(run_id))
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn get_agent_details(&self, agent_id: &str) -> CrewforgeResult<Agent> {
        self.registry
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CrewforgeError::AgentNotFound(agent_id.to_string()))
    }

    /// Every agent in registration order.
    pub async fn all_agent_details(&self) -> Vec<Agent> {
        self.registry.read().await.agents().to_vec()
    }

    /// Add an agent; it is eligible from the next scheduling tick.
    pub async fn register_agent(&self, agent: Agent) -> CrewforgeResult<()> {
        self.registry.write().await.register(agent)
    }

    pub async fn remove_agent(&self, agent_id: &str) -> CrewforgeResult<Agent> {
        self.registry.write().await.remove(agent_id)
    }

    pub async fn set_agent_available(&self, agent_id: &str, available: bool) -> CrewforgeResult<()> {
        self.registry.write().await.set_available(agent_id, available)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// The last `limit` bus messages, oldest first.
    pub fn get_message_log(&self, limit: usize) -> Vec<Message> {
        self.bus.recent(limit)
    }

    pub fn run_messages(&self, run_id: Uuid) -> Vec<Message> {
        self.bus.for_run(run_id)
    }

    /// Live feed of bus messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.bus.subscribe()
    }

    /// Snapshot over every run's tasks. The snapshot is also kept in the
    /// metrics history.
    pub async fn get_performance_metrics(&self) -> MetricsSnapshot {
        let snapshot = collect_snapshot(&self.aggregator, &self.registry, &self.runs, &self.bus).await;
        self.history.record(snapshot.clone());
        snapshot
    }

    /// The last `limit` recorded snapshots, oldest first.
    pub fn metrics_history(&self, limit: usize) -> Vec<MetricsSnapshot> {
        self.history.recent(limit)
    }

    pub fn average_completion_rate(&self) -> Option<f64> {
        self.history.average_completion_rate()
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        let (agents, busy_agents) = {
            let registry = self.registry.read().await;
            (registry.len(), registry.busy_count())
        };

        let mut runs = Vec::new();
        for (run_id, run) in self.runs.read().await.iter() {
            let graph = run.graph.read().await;
            runs.push(RunSummary {
                run_id: *run_id,
                description: run.project.description.clone(),
                status: *run.status.borrow(),
                total_tasks: graph.len(),
                completed_tasks: graph.count(TaskStatus::Completed),
                started_at: run.started_at,
                finished_at: *run.finished_at.lock(),
            });
        }
        runs.sort_by_key(|r| r.started_at);

        SystemStatus {
            running: self.is_running(),
            agents,
            busy_agents,
            total_messages: self.bus.len(),
            runs,
        }
    }

    /// Tasks, artifacts and a one-line summary of a run.
    pub async fn run_report(&self, run_id: Uuid) -> CrewforgeResult<RunReport> {
        let runs = self.runs.read().await;
        let run = runs.get(&run_id).ok_or(CrewforgeError::RunNotFound(run_id))?;
        let status = *run.status.borrow();
        let tasks: Vec<Task> = run.graph.read().await.tasks().into_iter().cloned().collect();

        let mut artifacts = Vec::new();
        let mut completed = 0;
        let mut failed = 0;
        let mut blocked = 0;
        let mut timed_out = 0;
        for task in &tasks {
            match task.status {
                TaskStatus::Completed => {
                    completed += 1;
                    if let Some(result) = &task.result {
                        artifacts.extend(result.artifacts.iter().cloned());
                    }
                }
                TaskStatus::Failed => failed += 1,
                TaskStatus::Blocked => blocked += 1,
                TaskStatus::TimedOut => timed_out += 1,
                _ => {}
            }
        }

        let summary = format!(
            "Run {status}: {completed}/{} tasks completed, {failed} failed, {blocked} blocked, {timed_out} timed out, {} artifacts produced",
            tasks.len(),
            artifacts.len()
        );

        Ok(RunReport {
            run_id,
            status,
            project: run.project.clone(),
            summary,
            total_tasks: tasks.len(),
            completed_tasks: completed,
            failed_tasks: failed + timed_out,
            tasks,
            artifacts,
        })
    }

    fn spawn_sampler(&self, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let aggregator = self.aggregator.clone();
        let registry = self.registry.clone();
        let runs = self.runs.clone();
        let bus = self.bus.clone();
        let history = self.history.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; sample on the interval only.
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let snapshot = collect_snapshot(&aggregator, &registry, &runs, &bus).await;
                        history.record(snapshot);
                    }
                }
            }
            debug!("Metrics sampler stopped");
        })
    }
}

/// Registry first, then graphs, matching the dispatcher's lock order.
async fn collect_snapshot(
    aggregator: &MetricsAggregator,
    registry: &RwLock<AgentRegistry>,
    runs: &RwLock<HashMap<Uuid, RunHandle>>,
    bus: &MessageBus,
) -> MetricsSnapshot {
    let graphs: Vec<Arc<RwLock<TaskGraph>>> =
        runs.read().await.values().map(|run| run.graph.clone()).collect();

    let registry = registry.read().await;
    let mut tasks = Vec::new();
    for graph in &graphs {
        tasks.extend(graph.read().await.tasks().into_iter().cloned());
    }
    aggregator.snapshot(&tasks, &registry, bus)
}
