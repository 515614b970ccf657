use crate::types::{MarkEffect, Task, TaskOutcome, TaskResult, TaskStatus};
use chrono::Utc;
use crewforge_core::{
    CrewforgeError, CrewforgeResult, GraphIntegrityError, TaskError, TaskErrorKind,
};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Directed acyclic graph of tasks keyed by dependency edges.
///
/// Insertion order is kept and used for every listing, so scheduling is
/// reproducible.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: HashMap<Uuid, Task>,
    order: Vec<Uuid>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task whose dependencies are already in the graph.
    ///
    /// A task that depends on an already failed, blocked or timed-out task is
    /// inserted as `Blocked`.
    pub fn add_task(&mut self, task: Task) -> CrewforgeResult<Uuid> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphIntegrityError::DuplicateTask(task.id).into());
        }
        if task.dependencies.contains(&task.id) {
            return Err(GraphIntegrityError::Cycle { task: task.id }.into());
        }
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|dep| !self.tasks.contains_key(dep))
        {
            return Err(GraphIntegrityError::UnknownDependency {
                task: task.id,
                dependency: *missing,
            }
            .into());
        }

        let id = self.insert(task);
        self.propagate_blocked();
        Ok(id)
    }

    /// Add a batch of tasks that may reference each other.
    ///
    /// Either every task is inserted, in batch order, or none is.
    pub fn add_tasks(&mut self, batch: Vec<Task>) -> CrewforgeResult<Vec<Uuid>> {
        let mut batch_ids = HashSet::new();
        for task in &batch {
            if self.tasks.contains_key(&task.id) || !batch_ids.insert(task.id) {
                return Err(GraphIntegrityError::DuplicateTask(task.id).into());
            }
        }
        for task in &batch {
            if let Some(missing) = task
                .dependencies
                .iter()
                .find(|dep| !self.tasks.contains_key(dep) && !batch_ids.contains(dep))
            {
                return Err(GraphIntegrityError::UnknownDependency {
                    task: task.id,
                    dependency: *missing,
                }
                .into());
            }
        }

        // Existing tasks never depend on batch tasks, so a cycle can only
        // run through the batch itself.
        let edges: HashMap<Uuid, &[Uuid]> = batch
            .iter()
            .map(|t| (t.id, t.dependencies.as_slice()))
            .collect();
        let mut visited = HashMap::new();
        for task in &batch {
            if let Some(on_cycle) = dfs_cycle(task.id, &edges, &mut visited) {
                return Err(GraphIntegrityError::Cycle { task: on_cycle }.into());
            }
        }

        let ids = batch.into_iter().map(|task| self.insert(task)).collect();
        self.propagate_blocked();
        Ok(ids)
    }

    fn insert(&mut self, mut task: Task) -> Uuid {
        let mut seen = HashSet::new();
        task.dependencies.retain(|dep| seen.insert(*dep));
        let id = task.id;
        self.order.push(id);
        self.tasks.insert(id, task);
        id
    }

    /// Promote every `Pending` task whose dependencies are all `Completed`,
    /// then return all `Ready` tasks in insertion order.
    pub fn ready_tasks(&mut self) -> Vec<Uuid> {
        let promotable: Vec<Uuid> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks.get(id).is_some_and(|t| {
                    t.status == TaskStatus::Pending
                        && t.dependencies.iter().all(|dep| {
                            self.tasks
                                .get(dep)
                                .is_some_and(|d| d.status == TaskStatus::Completed)
                        })
                })
            })
            .copied()
            .collect();
        for id in &promotable {
            if let Some(task) = self.tasks.get_mut(id) {
                task.status = TaskStatus::Ready;
            }
        }

        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::Ready)
            })
            .copied()
            .collect()
    }

    /// `Ready -> Assigned`.
    pub fn assign(&mut self, id: Uuid, agent_id: &str) -> CrewforgeResult<()> {
        let task = self.transition(id, TaskStatus::Ready, TaskStatus::Assigned)?;
        task.assigned_agent = Some(agent_id.to_string());
        Ok(())
    }

    /// `Assigned -> InProgress`.
    pub fn start(&mut self, id: Uuid) -> CrewforgeResult<()> {
        let task = self.transition(id, TaskStatus::Assigned, TaskStatus::InProgress)?;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    fn transition(
        &mut self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> CrewforgeResult<&mut Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CrewforgeError::TaskNotFound(id))?;
        if task.status != from {
            return Err(invalid_transition(id, task.status, to));
        }
        task.status = to;
        Ok(task)
    }

    /// Apply an executor outcome to an in-flight task.
    ///
    /// A failure charges one attempt. While attempts remain the task returns
    /// to `Pending`; otherwise it becomes `TimedOut` (timeout kinds) or
    /// `Failed`, and its transitive dependents become `Blocked`.
    pub fn mark(&mut self, id: Uuid, outcome: TaskOutcome) -> CrewforgeResult<MarkEffect> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CrewforgeError::TaskNotFound(id))?;
        if !task.status.is_in_flight() {
            let target = match outcome {
                TaskOutcome::Completed(_) => TaskStatus::Completed,
                TaskOutcome::Failed(_) => TaskStatus::Failed,
            };
            return Err(invalid_transition(id, task.status, target));
        }

        match outcome {
            TaskOutcome::Completed(output) => {
                task.status = TaskStatus::Completed;
                task.finished_at = Some(Utc::now());
                task.result = Some(TaskResult::completed(output));
                Ok(MarkEffect::Completed)
            }
            TaskOutcome::Failed(error) => {
                task.attempt_count += 1;
                let attempt = task.attempt_count;
                if attempt < task.max_attempts {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent = None;
                    return Ok(MarkEffect::RetryScheduled { attempt });
                }

                let status = if error.kind.is_timeout() {
                    TaskStatus::TimedOut
                } else {
                    TaskStatus::Failed
                };
                task.status = status;
                task.finished_at = Some(Utc::now());
                task.result = Some(TaskResult::failed(error));
                let blocked = self.propagate_blocked();
                Ok(MarkEffect::Terminal {
                    status,
                    attempt,
                    blocked,
                })
            }
        }
    }

    /// Block every non-terminal task with a terminally failed dependency,
    /// transitively. Returns the newly blocked ids in insertion order.
    fn propagate_blocked(&mut self) -> Vec<Uuid> {
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get(id) {
                for dep in &task.dependencies {
                    dependents.entry(*dep).or_default().push(*id);
                }
            }
        }

        let mut queue: VecDeque<Uuid> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.status.is_terminal_failure())
            })
            .copied()
            .collect();
        let mut newly_blocked = HashSet::new();

        while let Some(failed) = queue.pop_front() {
            for dependent in dependents.get(&failed).into_iter().flatten() {
                let Some(task) = self.tasks.get_mut(dependent) else {
                    continue;
                };
                if task.status.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Blocked;
                task.assigned_agent = None;
                task.finished_at = Some(Utc::now());
                task.result = Some(TaskResult::failed(TaskError::failed(format!(
                    "blocked by failed dependency {failed}"
                ))));
                newly_blocked.insert(*dependent);
                queue.push_back(*dependent);
            }
        }

        self.order
            .iter()
            .filter(|id| newly_blocked.contains(id))
            .copied()
            .collect()
    }

    /// Force every non-terminal task to `TimedOut` at the run deadline.
    ///
    /// Tasks still `Ready` never found a capable idle agent and get
    /// [`TaskErrorKind::NoCapableAgent`]; the rest get
    /// [`TaskErrorKind::RunTimeout`].
    pub fn time_out_remaining(&mut self, detail: &str) -> Vec<Uuid> {
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for id in &self.order {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let kind = if task.status == TaskStatus::Ready {
                TaskErrorKind::NoCapableAgent
            } else {
                TaskErrorKind::RunTimeout
            };
            task.status = TaskStatus::TimedOut;
            task.finished_at = Some(now);
            task.result = Some(TaskResult::failed(TaskError::new(kind, detail)));
            timed_out.push(*id);
        }
        timed_out
    }

    /// Return an in-flight task to `Pending` without charging an attempt.
    pub fn requeue(&mut self, id: Uuid) -> CrewforgeResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CrewforgeError::TaskNotFound(id))?;
        if !task.status.is_in_flight() {
            return Err(invalid_transition(id, task.status, TaskStatus::Pending));
        }
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        Ok(())
    }

    /// True iff no task is Pending, Ready, Assigned or InProgress.
    pub fn is_drained(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let edges: HashMap<Uuid, &[Uuid]> = self
            .tasks
            .values()
            .map(|t| (t.id, t.dependencies.as_slice()))
            .collect();
        let mut visited = HashMap::new();
        self.order
            .iter()
            .any(|id| dfs_cycle(*id, &edges, &mut visited).is_some())
    }
}

fn invalid_transition(task: Uuid, from: TaskStatus, to: TaskStatus) -> CrewforgeError {
    CrewforgeError::InvalidTransition {
        task,
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Depth-first search for a back edge. Returns a task on the cycle.
///
/// `visited`: 1 = in progress, 2 = done. Edges to ids outside `edges` are
/// ignored.
fn dfs_cycle(
    id: Uuid,
    edges: &HashMap<Uuid, &[Uuid]>,
    visited: &mut HashMap<Uuid, u8>,
) -> Option<Uuid> {
    match visited.get(&id) {
        Some(1) => return Some(id),
        Some(2) => return None,
        _ => {}
    }
    let deps = edges.get(&id)?;
    visited.insert(id, 1);
    for dep in *deps {
        if let Some(on_cycle) = dfs_cycle(*dep, edges, visited) {
            return Some(on_cycle);
        }
    }
    visited.insert(id, 2);
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crewforge_agent::ExecutionOutput;
    use crewforge_core::Role;

    fn done() -> TaskOutcome {
        TaskOutcome::Completed(ExecutionOutput::new("ok"))
    }

    fn fail() -> TaskOutcome {
        TaskOutcome::Failed(TaskError::failed("boom"))
    }

    /// Drive a ready task through assign and start.
    fn dispatch(graph: &mut TaskGraph, id: Uuid) {
        graph.assign(id, "agent").unwrap();
        graph.start(id).unwrap();
    }

    #[test]
    fn test_empty_graph() {
        let mut graph = TaskGraph::new();
        assert!(graph.is_empty());
        assert!(graph.is_drained());
        assert!(graph.ready_tasks().is_empty());
    }

    #[test]
    fn test_add_and_get() {
        let mut graph = TaskGraph::new();
        let id = graph.add_task(Task::new("Test task", Some(Role::Backend))).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(id).unwrap().description, "Test task");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut graph = TaskGraph::new();
        let ghost = Uuid::new_v4();
        let err = graph
            .add_task(Task::new("orphan", None).with_dependencies(vec![ghost]))
            .unwrap_err();
        assert!(matches!(
            err,
            CrewforgeError::Graph(GraphIntegrityError::UnknownDependency { dependency, .. }) if dependency == ghost
        ));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut graph = TaskGraph::new();
        let mut task = Task::new("loop", None);
        task.dependencies = vec![task.id];
        let err = graph.add_task(task).unwrap_err();
        assert!(matches!(err, CrewforgeError::Graph(GraphIntegrityError::Cycle { .. })));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut graph = TaskGraph::new();
        let task = Task::new("once", None);
        graph.add_task(task.clone()).unwrap();
        let err = graph.add_task(task).unwrap_err();
        assert!(matches!(err, CrewforgeError::Graph(GraphIntegrityError::DuplicateTask(_))));
    }

    #[test]
    fn test_batch_cycle_rejected_atomically() {
        let mut graph = TaskGraph::new();
        let mut a = Task::new("A", None);
        let mut b = Task::new("B", None);
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        let c = Task::new("C", None);

        let err = graph.add_tasks(vec![c, a, b]).unwrap_err();
        assert!(matches!(err, CrewforgeError::Graph(GraphIntegrityError::Cycle { .. })));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_batch_forward_references() {
        let mut graph = TaskGraph::new();
        let first = Task::new("first", None);
        let second = Task::new("second", None).with_dependencies(vec![first.id]);
        // Dependent listed before its dependency.
        let ids = graph.add_tasks(vec![second, first]).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!graph.has_cycle());
        assert_eq!(graph.ready_tasks(), vec![ids[1]]);
    }

    #[test]
    fn test_ready_tasks_in_insertion_order() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None)).unwrap();
        let b = graph.add_task(Task::new("B", None)).unwrap();
        let c = graph.add_task(Task::new("C", None).with_dependencies(vec![a])).unwrap();

        assert_eq!(graph.ready_tasks(), vec![a, b]);
        assert_eq!(graph.get(a).unwrap().status, TaskStatus::Ready);
        assert_eq!(graph.get(c).unwrap().status, TaskStatus::Pending);

        // Still Ready on the next call.
        assert_eq!(graph.ready_tasks(), vec![a, b]);

        dispatch(&mut graph, a);
        graph.mark(a, done()).unwrap();
        assert_eq!(graph.ready_tasks(), vec![b, c]);
    }

    #[test]
    fn test_dependency_chain() {
        let mut graph = TaskGraph::new();
        let plan = graph.add_task(Task::new("plan", Some(Role::ProjectManager))).unwrap();
        let build = graph
            .add_task(Task::new("build", Some(Role::Backend)).with_dependencies(vec![plan]))
            .unwrap();
        let integrate = graph
            .add_task(Task::new("integrate", Some(Role::ProjectManager)).with_dependencies(vec![build]))
            .unwrap();

        for expected in [plan, build, integrate] {
            assert_eq!(graph.ready_tasks(), vec![expected]);
            dispatch(&mut graph, expected);
            assert_eq!(graph.mark(expected, done()).unwrap(), MarkEffect::Completed);
        }
        assert!(graph.is_drained());
        assert_eq!(graph.count(TaskStatus::Completed), 3);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut graph = TaskGraph::new();
        let id = graph.add_task(Task::new("A", None)).unwrap();

        assert!(matches!(
            graph.assign(id, "x").unwrap_err(),
            CrewforgeError::InvalidTransition { .. }
        ));
        assert!(graph.start(id).is_err());
        assert!(graph.mark(id, done()).is_err());
        assert!(graph.requeue(id).is_err());
        assert!(matches!(
            graph.assign(Uuid::new_v4(), "x").unwrap_err(),
            CrewforgeError::TaskNotFound(_)
        ));
    }

    #[test]
    fn test_retry_then_block() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None).with_max_attempts(2)).unwrap();
        let b = graph.add_task(Task::new("B", None).with_dependencies(vec![a])).unwrap();
        let c = graph.add_task(Task::new("C", None).with_dependencies(vec![b])).unwrap();

        graph.ready_tasks();
        dispatch(&mut graph, a);
        assert_eq!(
            graph.mark(a, fail()).unwrap(),
            MarkEffect::RetryScheduled { attempt: 1 }
        );
        let task = graph.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        assert!(task.assigned_agent.is_none());

        assert_eq!(graph.ready_tasks(), vec![a]);
        dispatch(&mut graph, a);
        assert_eq!(
            graph.mark(a, fail()).unwrap(),
            MarkEffect::Terminal {
                status: TaskStatus::Failed,
                attempt: 2,
                blocked: vec![b, c],
            }
        );
        assert_eq!(graph.get(b).unwrap().status, TaskStatus::Blocked);
        assert_eq!(graph.get(c).unwrap().status, TaskStatus::Blocked);
        assert!(graph.is_drained());
        assert_eq!(graph.get(a).unwrap().retries(), 1);
    }

    #[test]
    fn test_timeout_exhaustion_is_timed_out() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None).with_max_attempts(1)).unwrap();
        let b = graph.add_task(Task::new("B", None).with_dependencies(vec![a])).unwrap();
        graph.ready_tasks();
        dispatch(&mut graph, a);

        let effect = graph
            .mark(a, TaskOutcome::Failed(TaskError::timeout("900s")))
            .unwrap();
        assert!(matches!(effect, MarkEffect::Terminal { status: TaskStatus::TimedOut, .. }));
        assert_eq!(graph.get(b).unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn test_add_after_failure_is_blocked() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None).with_max_attempts(1)).unwrap();
        graph.ready_tasks();
        dispatch(&mut graph, a);
        graph.mark(a, fail()).unwrap();

        let late = graph.add_task(Task::new("late", None).with_dependencies(vec![a])).unwrap();
        assert_eq!(graph.get(late).unwrap().status, TaskStatus::Blocked);
        assert!(graph.ready_tasks().is_empty());
    }

    #[test]
    fn test_time_out_remaining() {
        let mut graph = TaskGraph::new();
        let running = graph.add_task(Task::new("running", None)).unwrap();
        let waiting = graph.add_task(Task::new("waiting", Some(Role::Devops))).unwrap();
        let pending = graph
            .add_task(Task::new("pending", None).with_dependencies(vec![running]))
            .unwrap();
        graph.ready_tasks();
        dispatch(&mut graph, running);

        let forced = graph.time_out_remaining("run deadline");
        assert_eq!(forced, vec![running, waiting, pending]);
        assert!(graph.is_drained());
        let kind = |id| graph.get(id).unwrap().result.as_ref().unwrap().error.as_ref().unwrap().kind;
        assert_eq!(kind(running), TaskErrorKind::RunTimeout);
        assert_eq!(kind(waiting), TaskErrorKind::NoCapableAgent);
        assert_eq!(kind(pending), TaskErrorKind::RunTimeout);
    }

    #[test]
    fn test_requeue_keeps_attempts() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None)).unwrap();
        graph.ready_tasks();
        dispatch(&mut graph, a);
        graph.requeue(a).unwrap();
        let task = graph.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(!graph.is_drained());
    }

    #[test]
    fn test_timestamps_ordered() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None)).unwrap();
        graph.ready_tasks();
        dispatch(&mut graph, a);
        graph.mark(a, done()).unwrap();
        let task = graph.get(a).unwrap();
        let started = task.started_at.unwrap();
        let finished = task.finished_at.unwrap();
        assert!(task.created_at <= started);
        assert!(started <= finished);
    }

    #[test]
    fn test_duplicate_dependencies_collapsed() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Task::new("A", None)).unwrap();
        let b = graph
            .add_task(Task::new("B", None).with_dependencies(vec![a, a]))
            .unwrap();
        assert_eq!(graph.get(b).unwrap().dependencies, vec![a]);
    }
}
