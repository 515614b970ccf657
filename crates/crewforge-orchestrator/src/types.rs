use chrono::{DateTime, Utc};
use crewforge_agent::{Artifact, ExecutionOutput, ExecutionRequest};
use crewforge_core::{Role, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a task in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
    TimedOut,
}

impl TaskStatus {
    /// Completed, Failed, Blocked or TimedOut.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::TimedOut
        )
    }

    /// Terminal and not Completed. Dependents of such a task are blocked.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::TimedOut
        )
    }

    /// Held by an agent.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Result attached to a task once it reaches a terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub artifacts: Vec<Artifact>,
    pub summary: String,
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn completed(output: ExecutionOutput) -> Self {
        Self {
            artifacts: output.artifacts,
            summary: output.summary,
            error: None,
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            artifacts: Vec::new(),
            summary: error.to_string(),
            error: Some(error),
        }
    }
}

/// What the dispatcher reports back to the graph for one executor call.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(ExecutionOutput),
    Failed(TaskError),
}

/// Effect of applying a [`TaskOutcome`] to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkEffect {
    /// The task is now `Completed`.
    Completed,
    /// The task went back to `Pending`; `attempt` failures so far.
    RetryScheduled { attempt: u32 },
    /// Attempts exhausted. `blocked` lists the dependents that became `Blocked`.
    Terminal {
        status: TaskStatus,
        attempt: u32,
        blocked: Vec<Uuid>,
    },
}

/// A unit of decomposed project work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// `None` means unassigned: any idle agent may take it.
    pub role_tag: Option<Role>,
    pub dependencies: Vec<Uuid>,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    /// Failed executor invocations so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Carried from plans for reporting; scheduling stays FIFO.
    #[serde(default)]
    pub priority: u32,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(description: impl Into<String>, role_tag: Option<Role>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            deliverables: Vec::new(),
            role_tag,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            attempt_count: 0,
            max_attempts: 2,
            priority: 1,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_deliverables(mut self, deliverables: Vec<String>) -> Self {
        self.deliverables = deliverables;
        self
    }

    /// Clamped to at least one attempt.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Number of failures that led to a retry.
    pub fn retries(&self) -> u32 {
        let exhausted = matches!(self.status, TaskStatus::Failed | TaskStatus::TimedOut)
            && self.attempt_count >= self.max_attempts;
        if exhausted {
            self.attempt_count.saturating_sub(1)
        } else {
            self.attempt_count
        }
    }

    /// The executor request for this task.
    pub fn to_request(&self, timeout: Duration) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.description.clone(), self.role_tag, timeout)
            .with_requirements(self.requirements.clone())
            .with_deliverables(self.deliverables.clone());
        request.task_id = self.id;
        request.constraints = self.constraints.clone();
        request
    }
}

/// Availability of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Unavailable,
}

/// Cumulative per-agent counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub completed: u32,
    pub failed: u32,
    pub busy_time_ms: u64,
}

/// How an agent's task ended when the agent is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Failed,
    /// Stopped before an outcome; counts toward busy time only.
    Cancelled,
}

/// A capability-tagged worker that executes at most one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: Role,
    pub capability_tags: BTreeSet<String>,
    pub status: AgentStatus,
    /// Set iff `status == Busy`.
    pub current_task: Option<Uuid>,
    pub stats: AgentStats,
}

impl Agent {
    /// An idle agent advertising only its role tag.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            capability_tags: BTreeSet::from([role.as_tag().to_string()]),
            status: AgentStatus::Idle,
            current_task: None,
            stats: AgentStats::default(),
        }
    }

    /// The standard roster member for a role, with the role profile's tags.
    pub fn for_role(role: Role) -> Self {
        let profile = crewforge_agent::profile_for(role);
        Self::new(role.default_agent_id(), role).with_capabilities(profile.capability_tags)
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Whether this agent can take a task with the given role tag.
    pub fn matches(&self, role_tag: Option<Role>) -> bool {
        role_tag.map_or(true, |role| self.capability_tags.contains(role.as_tag()))
    }
}

/// Lifecycle of one submitted project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    TimedOut,
    Stopped,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::TimedOut => write!(f, "timed_out"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crewforge_agent::ArtifactKind;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Implement auth module", Some(Role::Backend));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.role_tag, Some(Role::Backend));
        assert!(task.dependencies.is_empty());
        assert!(task.result.is_none());
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_max_attempts_clamped() {
        let task = Task::new("x", None).with_max_attempts(0);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn test_status_classes() {
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::TimedOut.is_terminal_failure());
        assert!(!TaskStatus::Completed.is_terminal_failure());
        assert!(TaskStatus::Assigned.is_in_flight());
        assert!(!TaskStatus::Ready.is_terminal());
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_retries_count() {
        let mut task = Task::new("x", None).with_max_attempts(2);
        task.attempt_count = 1;
        task.status = TaskStatus::Completed;
        assert_eq!(task.retries(), 1);

        task.attempt_count = 2;
        task.status = TaskStatus::Failed;
        assert_eq!(task.retries(), 1);
    }

    #[test]
    fn test_to_request_carries_task_fields() {
        let task = Task::new("Build API", Some(Role::Backend))
            .with_constraints(vec!["no unsafe".into()])
            .with_deliverables(vec!["server.py".into()]);
        let request = task.to_request(Duration::from_secs(3));
        assert_eq!(request.task_id, task.id);
        assert_eq!(request.constraints, vec!["no unsafe".to_string()]);
        assert_eq!(request.deliverables, vec!["server.py".to_string()]);
        assert_eq!(request.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_agent_matching() {
        let agent = Agent::new("be-1", Role::Backend);
        assert!(agent.matches(Some(Role::Backend)));
        assert!(!agent.matches(Some(Role::Frontend)));
        assert!(agent.matches(None));

        let fullstack = agent.with_capabilities(["frontend"]);
        assert!(fullstack.matches(Some(Role::Frontend)));
    }

    #[test]
    fn test_default_roster_agent() {
        let agent = Agent::for_role(Role::Devops);
        assert_eq!(agent.id, "devops_coder");
        assert!(agent.capability_tags.contains("devops"));
        assert!(agent.capability_tags.contains("docker"));
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[test]
    fn test_task_result_from_output() {
        let output = crewforge_agent::ExecutionOutput::new("done")
            .with_artifact(Artifact::new(ArtifactKind::Code, "print(1)"));
        let result = TaskResult::completed(output);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::TimedOut);
    }
}
