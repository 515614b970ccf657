use crate::bus::{Endpoint, MessageBus, MessageKind};
use crate::config::CoordinatorConfig;
use crate::registry::AgentRegistry;
use crate::task_graph::TaskGraph;
use crate::types::{MarkEffect, ReleaseOutcome, RunStatus, TaskOutcome, TaskStatus};
use crewforge_agent::{ExecutionOutput, ExecutionRequest, TaskExecutor};
use crewforge_core::{TaskError, TaskErrorKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RUN_DEADLINE_DETAIL: &str = "run deadline exceeded";

/// Result of one spawned executor call.
struct Finished {
    task_id: Uuid,
    agent_id: String,
    result: Result<ExecutionOutput, TaskError>,
}

/// A task reserved for an agent, ready to be launched.
struct Dispatch {
    task_id: Uuid,
    agent_id: String,
    request: ExecutionRequest,
    attempt: u32,
}

/// Drives one run: drains ready tasks onto idle agents until the graph is
/// drained, the run deadline passes, or a stop is requested.
///
/// The dispatcher is the only writer of task and agent state. Locks are
/// always taken registry first, then graph, and are never held across an
/// executor call.
pub struct Dispatcher {
    run_id: Uuid,
    graph: Arc<RwLock<TaskGraph>>,
    registry: Arc<RwLock<AgentRegistry>>,
    bus: Arc<MessageBus>,
    executor: Arc<dyn TaskExecutor>,
    tick_interval: Duration,
    run_timeout: Duration,
    task_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        run_id: Uuid,
        graph: Arc<RwLock<TaskGraph>>,
        registry: Arc<RwLock<AgentRegistry>>,
        bus: Arc<MessageBus>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            run_id,
            graph,
            registry,
            bus,
            executor,
            tick_interval: Duration::from_millis(250),
            run_timeout: Duration::from_secs(3600),
            task_timeout: Some(Duration::from_secs(900)),
        }
    }

    /// Take tick, run deadline and per-task timeout from `config`.
    pub fn with_config(mut self, config: &CoordinatorConfig) -> Self {
        self.tick_interval = config.tick_interval();
        self.run_timeout = config.run_timeout();
        self.task_timeout = config.task_timeout();
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run to completion. A `true` on `stop` (or a dropped sender) halts the
    /// run and requeues whatever was in flight.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> RunStatus {
        let deadline = Instant::now() + self.run_timeout;
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let mut running: HashMap<Id, (Uuid, String)> = HashMap::new();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task_count = self.graph.read().await.len();
        info!(run_id = %self.run_id, tasks = task_count, "Dispatcher: run started");
        self.status_update(json!({ "event": "run_started", "tasks": task_count }));

        loop {
            let stopping = *stop.borrow_and_update();
            if stopping {
                return self.halt(in_flight, running).await;
            }
            if Instant::now() >= deadline {
                return self.expire(in_flight, running).await;
            }

            for dispatch in self.schedule(deadline).await {
                self.launch(dispatch, &mut in_flight, &mut running);
            }

            if in_flight.is_empty() && self.graph.read().await.is_drained() {
                return self.finish(RunStatus::Completed).await;
            }

            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        return self.halt(in_flight, running).await;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return self.expire(in_flight, running).await;
                }
                Some(joined) = in_flight.join_next_with_id() => {
                    self.settle(joined, &mut running).await;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Reserve an idle capable agent for every ready task, in creation order.
    async fn schedule(&self, deadline: Instant) -> Vec<Dispatch> {
        let mut registry = self.registry.write().await;
        let mut graph = self.graph.write().await;
        let mut dispatches = Vec::new();

        for task_id in graph.ready_tasks() {
            let Some(task) = graph.get(task_id) else {
                continue;
            };
            let Some(agent_id) = registry
                .find_idle_matching(task.role_tag)
                .map(|agent| agent.id.clone())
            else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let limit = self
                .task_timeout
                .map_or(remaining, |timeout| timeout.min(remaining));
            let request = task.to_request(limit);
            let attempt = task.attempt_count + 1;

            if let Err(e) = registry.reserve(&agent_id, task_id) {
                warn!(task_id = %task_id, agent = %agent_id, error = %e, "Reservation failed");
                continue;
            }
            if let Err(e) = graph
                .assign(task_id, &agent_id)
                .and_then(|()| graph.start(task_id))
            {
                warn!(task_id = %task_id, agent = %agent_id, error = %e, "Assignment failed");
                if let Err(e) = registry.release(&agent_id, ReleaseOutcome::Cancelled) {
                    error!(agent = %agent_id, error = %e, "Release after failed assignment");
                }
                continue;
            }

            dispatches.push(Dispatch {
                task_id,
                agent_id,
                request,
                attempt,
            });
        }
        dispatches
    }

    fn launch(
        &self,
        dispatch: Dispatch,
        in_flight: &mut JoinSet<Finished>,
        running: &mut HashMap<Id, (Uuid, String)>,
    ) {
        let Dispatch {
            task_id,
            agent_id,
            request,
            attempt,
        } = dispatch;

        info!(
            run_id = %self.run_id,
            task_id = %task_id,
            agent = %agent_id,
            attempt,
            "Task assigned"
        );
        self.bus.publish(
            Some(self.run_id),
            Endpoint::Dispatcher,
            Endpoint::Agent(agent_id.clone()),
            MessageKind::Assignment,
            json!({
                "task_id": task_id,
                "description": request.description,
                "role": request.role_tag,
                "attempt": attempt,
            }),
        );

        let executor = self.executor.clone();
        let owner = agent_id.clone();
        let handle = in_flight.spawn(async move {
            let limit = request.timeout;
            let result = match tokio::time::timeout(limit, executor.execute(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::timeout(format!(
                    "no result within {}ms",
                    limit.as_millis()
                ))),
            };
            Finished {
                task_id,
                agent_id: owner,
                result,
            }
        });
        running.insert(handle.id(), (task_id, agent_id));
    }

    /// Turn a joined executor call into a graph outcome. A panicking
    /// executor counts as a failed attempt.
    async fn settle(
        &self,
        joined: Result<(Id, Finished), JoinError>,
        running: &mut HashMap<Id, (Uuid, String)>,
    ) {
        let (task_id, agent_id, result) = match joined {
            Ok((id, finished)) => {
                running.remove(&id);
                (finished.task_id, finished.agent_id, finished.result)
            }
            Err(e) => {
                let Some((task_id, agent_id)) = running.remove(&e.id()) else {
                    error!(run_id = %self.run_id, error = %e, "Untracked executor call failed");
                    return;
                };
                let detail = if e.is_panic() {
                    "executor panicked".to_string()
                } else {
                    format!("executor call aborted: {e}")
                };
                (task_id, agent_id, Err(TaskError::failed(detail)))
            }
        };

        match result {
            Ok(output) => self.complete(task_id, &agent_id, output).await,
            Err(error) => self.fail(task_id, &agent_id, error).await,
        }
    }

    async fn complete(&self, task_id: Uuid, agent_id: &str, output: ExecutionOutput) {
        let summary = output.summary.clone();
        let artifacts: Vec<String> = output
            .artifacts
            .iter()
            .filter_map(|a| a.file_path.clone())
            .collect();

        {
            let mut registry = self.registry.write().await;
            let mut graph = self.graph.write().await;
            if let Err(e) = graph.mark(task_id, TaskOutcome::Completed(output)) {
                error!(task_id = %task_id, error = %e, "Could not record completion");
            }
            match registry.release(agent_id, ReleaseOutcome::Completed) {
                Ok(elapsed) => debug!(agent = %agent_id, elapsed_ms = elapsed.as_millis(), "Agent released"),
                Err(e) => error!(agent = %agent_id, error = %e, "Release failed"),
            }
        }

        info!(run_id = %self.run_id, task_id = %task_id, agent = %agent_id, "Task completed");
        self.bus.publish(
            Some(self.run_id),
            Endpoint::Agent(agent_id.to_string()),
            Endpoint::Dispatcher,
            MessageKind::Completion,
            json!({
                "task_id": task_id,
                "summary": summary,
                "artifacts": artifacts,
            }),
        );
    }

    async fn fail(&self, task_id: Uuid, agent_id: &str, failure: TaskError) {
        let effect = {
            let mut registry = self.registry.write().await;
            let mut graph = self.graph.write().await;
            let effect = graph.mark(task_id, TaskOutcome::Failed(failure.clone()));
            if let Err(e) = registry.release(agent_id, ReleaseOutcome::Failed) {
                error!(agent = %agent_id, error = %e, "Release failed");
            }
            effect
        };

        let (attempt, retry_scheduled, blocked) = match effect {
            Ok(MarkEffect::RetryScheduled { attempt }) => {
                warn!(
                    run_id = %self.run_id,
                    task_id = %task_id,
                    agent = %agent_id,
                    attempt,
                    error = %failure,
                    "Task failed, retry scheduled"
                );
                (attempt, true, Vec::new())
            }
            Ok(MarkEffect::Terminal {
                status,
                attempt,
                blocked,
            }) => {
                error!(
                    run_id = %self.run_id,
                    task_id = %task_id,
                    agent = %agent_id,
                    attempt,
                    %status,
                    error = %failure,
                    "Task failed terminally"
                );
                (attempt, false, blocked)
            }
            Ok(MarkEffect::Completed) => return,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Could not record failure");
                return;
            }
        };

        self.bus.publish(
            Some(self.run_id),
            Endpoint::Agent(agent_id.to_string()),
            Endpoint::Dispatcher,
            MessageKind::Failure,
            json!({
                "task_id": task_id,
                "kind": failure.kind,
                "detail": failure.detail,
                "attempt": attempt,
                "retry_scheduled": retry_scheduled,
            }),
        );
        if !blocked.is_empty() {
            self.status_update(json!({
                "event": "tasks_blocked",
                "failed_task": task_id,
                "blocked": blocked,
            }));
        }
    }

    /// Stop: abort in-flight calls, free their agents and put their tasks
    /// back to `Pending`.
    async fn halt(
        &self,
        mut in_flight: JoinSet<Finished>,
        running: HashMap<Id, (Uuid, String)>,
    ) -> RunStatus {
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}

        {
            let mut registry = self.registry.write().await;
            let mut graph = self.graph.write().await;
            for (task_id, agent_id) in running.values() {
                if let Err(e) = graph.requeue(*task_id) {
                    warn!(task_id = %task_id, error = %e, "Requeue failed");
                }
                if let Err(e) = registry.release(agent_id, ReleaseOutcome::Cancelled) {
                    error!(agent = %agent_id, error = %e, "Release failed");
                }
            }
        }

        info!(run_id = %self.run_id, requeued = running.len(), "Dispatcher: run stopped");
        self.finish(RunStatus::Stopped).await
    }

    /// Deadline: abort in-flight calls, free their agents and time out every
    /// non-terminal task. Calls that already returned output are completed
    /// first; if that drains the graph the run counts as completed.
    async fn expire(
        &self,
        mut in_flight: JoinSet<Finished>,
        mut running: HashMap<Id, (Uuid, String)>,
    ) -> RunStatus {
        in_flight.abort_all();
        while let Some(joined) = in_flight.join_next_with_id().await {
            if let Ok((id, finished)) = joined {
                if let Ok(output) = finished.result {
                    running.remove(&id);
                    self.complete(finished.task_id, &finished.agent_id, output).await;
                }
            }
        }
        if running.is_empty() && self.graph.read().await.is_drained() {
            return self.finish(RunStatus::Completed).await;
        }

        let timed_out = {
            let mut registry = self.registry.write().await;
            let mut graph = self.graph.write().await;
            for (_, agent_id) in running.values() {
                if let Err(e) = registry.release(agent_id, ReleaseOutcome::Failed) {
                    error!(agent = %agent_id, error = %e, "Release failed");
                }
            }
            graph.time_out_remaining(RUN_DEADLINE_DETAIL)
        };

        for (task_id, agent_id) in running.values() {
            self.bus.publish(
                Some(self.run_id),
                Endpoint::Agent(agent_id.clone()),
                Endpoint::Dispatcher,
                MessageKind::Failure,
                json!({
                    "task_id": task_id,
                    "kind": TaskErrorKind::RunTimeout,
                    "detail": RUN_DEADLINE_DETAIL,
                    "retry_scheduled": false,
                }),
            );
        }

        warn!(
            run_id = %self.run_id,
            timed_out = timed_out.len(),
            aborted = running.len(),
            "Dispatcher: run deadline exceeded"
        );
        self.status_update(json!({ "event": "tasks_timed_out", "tasks": timed_out }));
        self.finish(RunStatus::TimedOut).await
    }

    async fn finish(&self, status: RunStatus) -> RunStatus {
        let (completed, failed, blocked, timed_out) = {
            let graph = self.graph.read().await;
            (
                graph.count(TaskStatus::Completed),
                graph.count(TaskStatus::Failed),
                graph.count(TaskStatus::Blocked),
                graph.count(TaskStatus::TimedOut),
            )
        };
        info!(
            run_id = %self.run_id,
            %status,
            completed,
            failed,
            blocked,
            timed_out,
            "Dispatcher: run finished"
        );
        self.status_update(json!({
            "event": "run_finished",
            "status": status,
            "completed": completed,
            "failed": failed,
            "blocked": blocked,
            "timed_out": timed_out,
        }));
        status
    }

    fn status_update(&self, payload: serde_json::Value) {
        self.bus.publish(
            Some(self.run_id),
            Endpoint::Dispatcher,
            Endpoint::Broadcast,
            MessageKind::StatusUpdate,
            payload,
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Agent, Task};
    use async_trait::async_trait;
    use crewforge_core::Role;

    struct Immediate;

    #[async_trait]
    impl TaskExecutor for Immediate {
        fn name(&self) -> &str {
            "instant"
        }

        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
            Ok(ExecutionOutput::new(format!("done: {}", request.description)))
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskExecutor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
            panic!("executor blew up");
        }
    }

    fn setup(
        tasks: Vec<Task>,
        executor: Arc<dyn TaskExecutor>,
    ) -> (Dispatcher, Arc<RwLock<TaskGraph>>, Arc<RwLock<AgentRegistry>>, Arc<MessageBus>) {
        let mut graph = TaskGraph::new();
        graph.add_tasks(tasks).unwrap();
        let mut registry = AgentRegistry::new();
        registry.register(Agent::for_role(Role::Backend)).unwrap();
        let graph = Arc::new(RwLock::new(graph));
        let registry = Arc::new(RwLock::new(registry));
        let bus = Arc::new(MessageBus::default());
        let dispatcher = Dispatcher::new(
            Uuid::new_v4(),
            graph.clone(),
            registry.clone(),
            bus.clone(),
            executor,
        )
        .with_config(&CoordinatorConfig {
            tick_interval_ms: 10,
            ..CoordinatorConfig::default()
        });
        (dispatcher, graph, registry, bus)
    }

    #[tokio::test]
    async fn test_empty_graph_completes_immediately() {
        let (dispatcher, _, _, bus) = setup(Vec::new(), Arc::new(Immediate));
        let (_tx, rx) = watch::channel(false);
        assert_eq!(dispatcher.run(rx).await, RunStatus::Completed);
        let last = bus.recent(1).pop().unwrap();
        assert_eq!(last.kind, MessageKind::StatusUpdate);
        assert_eq!(last.payload["event"], "run_finished");
    }

    #[tokio::test]
    async fn test_message_sequence_for_single_task() {
        let task = Task::new("build api", Some(Role::Backend));
        let id = task.id;
        let (dispatcher, graph, registry, bus) = setup(vec![task], Arc::new(Immediate));
        let (_tx, rx) = watch::channel(false);
        assert_eq!(dispatcher.run(rx).await, RunStatus::Completed);

        let kinds: Vec<MessageKind> = bus.recent(10).iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::StatusUpdate,
                MessageKind::Assignment,
                MessageKind::Completion,
                MessageKind::StatusUpdate,
            ]
        );
        let graph = graph.read().await;
        let task = graph.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agent.as_deref(), Some("backend_coder"));
        assert_eq!(registry.read().await.get("backend_coder").unwrap().stats.completed, 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_counts_as_failure() {
        let task = Task::new("build api", Some(Role::Backend)).with_max_attempts(1);
        let id = task.id;
        let (dispatcher, graph, registry, bus) = setup(vec![task], Arc::new(Panicking));
        let (_tx, rx) = watch::channel(false);
        assert_eq!(dispatcher.run(rx).await, RunStatus::Completed);

        let graph = graph.read().await;
        let task = graph.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.result.as_ref().unwrap().error.as_ref().unwrap();
        assert_eq!(error.detail, "executor panicked");

        let agent = registry.read().await.get("backend_coder").cloned().unwrap();
        assert_eq!(agent.status, crate::types::AgentStatus::Idle);
        assert_eq!(agent.stats.failed, 1);
        assert!(bus.recent(10).iter().any(|m| m.kind == MessageKind::Failure));
    }

    #[tokio::test]
    async fn test_deadline_keeps_output_that_already_arrived() {
        let done = Task::new("build api", Some(Role::Backend));
        let waiting = Task::new("deploy", Some(Role::Devops));
        let (done_id, waiting_id) = (done.id, waiting.id);
        let (dispatcher, graph, registry, bus) = setup(vec![done, waiting], Arc::new(Immediate));

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut in_flight = JoinSet::new();
        let mut running = HashMap::new();
        for dispatch in dispatcher.schedule(deadline).await {
            dispatcher.launch(dispatch, &mut in_flight, &mut running);
        }
        assert_eq!(running.len(), 1);
        // Let the executor call return before the deadline is handled.
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(dispatcher.expire(in_flight, running).await, RunStatus::TimedOut);
        let graph = graph.read().await;
        assert_eq!(graph.get(done_id).unwrap().status, TaskStatus::Completed);
        assert_eq!(graph.get(waiting_id).unwrap().status, TaskStatus::TimedOut);
        assert_eq!(registry.read().await.get("backend_coder").unwrap().stats.completed, 1);
        assert!(bus
            .recent(20)
            .iter()
            .filter(|m| m.kind == MessageKind::Failure)
            .all(|m| m.payload["task_id"] != json!(done_id)));
    }

    #[tokio::test]
    async fn test_stop_before_start_leaves_tasks_pending() {
        let task = Task::new("build api", Some(Role::Backend));
        let id = task.id;
        let (dispatcher, graph, _, _) = setup(vec![task], Arc::new(Immediate));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert_eq!(dispatcher.run(rx).await, RunStatus::Stopped);
        assert_eq!(graph.read().await.get(id).unwrap().status, TaskStatus::Pending);
    }
}
