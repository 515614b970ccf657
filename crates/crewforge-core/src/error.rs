use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`CrewforgeError`].
pub type CrewforgeResult<T> = Result<T, CrewforgeError>;

/// Top-level error type for the crewforge workspace.
///
/// Each variant corresponds to a condition that is rejected at an API
/// boundary. Task-level failures that happen during a run are not errors in
/// this sense; they are recorded as [`TaskError`] values on the task.
#[derive(Error, Debug)]
pub enum CrewforgeError {
    /// The task graph would violate one of its structural invariants.
    #[error("Graph integrity error: {0}")]
    Graph(#[from] GraphIntegrityError),

    /// `reserve` was called on an agent that is busy or unavailable.
    #[error("Agent not idle: {0}")]
    AgentNotIdle(String),

    /// No agent with the given id is registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent with the same id is already registered.
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// No task with the given id exists in the graph.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A task was asked to move between two states that are not connected.
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// The task being transitioned.
        task: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// No run with the given id was submitted.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// The coordinator is not accepting work.
    #[error("Coordinator is not running")]
    NotRunning,

    /// The decomposition strategy could not produce a task graph.
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural violations of the task graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphIntegrityError {
    /// Adding the task would close a dependency cycle.
    #[error("dependency cycle through task {task}")]
    Cycle {
        /// A task on the cycle.
        task: Uuid,
    },

    /// The task depends on an id that does not exist.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// The task declaring the dependency.
        task: Uuid,
        /// The missing dependency id.
        dependency: Uuid,
    },

    /// A task with this id is already in the graph.
    #[error("task {0} already exists")]
    DuplicateTask(Uuid),
}

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The executor ran and reported failure.
    Failed,
    /// The executor did not finish within the per-task timeout.
    Timeout,
    /// The executor backend is not installed or not reachable.
    Unavailable,
    /// The executor produced output that could not be interpreted.
    InvalidOutput,
    /// The invocation was cancelled because the system stopped.
    Cancelled,
    /// The run deadline passed before the task finished.
    RunTimeout,
    /// The run deadline passed while no capable agent was ever idle.
    NoCapableAgent,
}

impl TaskErrorKind {
    /// Whether this failure counts as a timeout for terminal-state purposes.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            TaskErrorKind::Timeout | TaskErrorKind::RunTimeout | TaskErrorKind::NoCapableAgent
        )
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskErrorKind::Failed => "failed",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Unavailable => "unavailable",
            TaskErrorKind::InvalidOutput => "invalid_output",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::RunTimeout => "run_timeout",
            TaskErrorKind::NoCapableAgent => "no_capable_agent",
        };
        f.write_str(s)
    }
}

/// A task-level failure: what went wrong and a human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct TaskError {
    /// Failure classification.
    pub kind: TaskErrorKind,
    /// Free-form detail (stderr excerpt, timeout length, ...).
    pub detail: String,
}

impl TaskError {
    /// Creates a new task error of the given kind.
    pub fn new(kind: TaskErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`TaskErrorKind::Failed`].
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Failed, detail)
    }

    /// Shorthand for [`TaskErrorKind::Timeout`].
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, detail)
    }

    /// Shorthand for [`TaskErrorKind::Unavailable`].
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Unavailable, detail)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_converts() {
        let id = Uuid::new_v4();
        let err: CrewforgeError = GraphIntegrityError::Cycle { task: id }.into();
        assert!(matches!(err, CrewforgeError::Graph(_)));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_task_error_display() {
        let err = TaskError::timeout("exceeded 30s");
        assert_eq!(err.to_string(), "timeout: exceeded 30s");
    }

    #[test]
    fn test_timeout_kinds() {
        assert!(TaskErrorKind::Timeout.is_timeout());
        assert!(TaskErrorKind::RunTimeout.is_timeout());
        assert!(!TaskErrorKind::Failed.is_timeout());
        assert!(!TaskErrorKind::Cancelled.is_timeout());
    }

    #[test]
    fn test_task_error_serialization() {
        let err = TaskError::new(TaskErrorKind::InvalidOutput, "not json");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("invalid_output"));
        let parsed: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }
}
