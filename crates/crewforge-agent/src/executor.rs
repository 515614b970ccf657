use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crewforge_core::{Role, TaskError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Everything an executor is told about a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: Uuid,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// File names the task is expected to produce under the output directory.
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// `None` for unassigned tasks.
    pub role_tag: Option<Role>,
    /// Upper bound the dispatcher will wait for this call.
    pub timeout: Duration,
    /// Inspect and answer only; nothing may be written to the output directory.
    #[serde(default)]
    pub read_only: bool,
}

impl ExecutionRequest {
    pub fn new(description: impl Into<String>, role_tag: Option<Role>, timeout: Duration) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            description: description.into(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            deliverables: Vec::new(),
            role_tag,
            timeout,
            read_only: false,
        }
    }

    /// Mark the request as side-effect free (planning, queries).
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_deliverables(mut self, deliverables: Vec<String>) -> Self {
        self.deliverables = deliverables;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Kind of artifact produced by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Plan,
    Code,
    Config,
    Report,
}

impl ArtifactKind {
    /// Default artifact kind for work done under a role.
    pub fn for_role(role: Option<Role>) -> Self {
        match role {
            Some(Role::ProjectManager) => ArtifactKind::Plan,
            Some(Role::Devops) => ArtifactKind::Config,
            Some(Role::Frontend) | Some(Role::Backend) | None => ArtifactKind::Code,
        }
    }
}

/// An artifact produced during task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub content: String,
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            file_path: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// Successful result of one executor invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub artifacts: Vec<Artifact>,
    pub summary: String,
}

impl ExecutionOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            summary: summary.into(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// The capability the dispatcher calls to actually perform a task.
///
/// Implementations must be cancel-safe: the dispatcher drops the future when
/// the per-task timeout or the run deadline fires, or when the system stops.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run one task to completion.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::new(ArtifactKind::Code, "fn main() {}").with_path("src/main.rs");
        assert_eq!(artifact.kind, ArtifactKind::Code);
        assert_eq!(artifact.file_path.as_deref(), Some("src/main.rs"));
    }

    #[test]
    fn test_artifact_kind_for_role() {
        assert_eq!(ArtifactKind::for_role(Some(Role::ProjectManager)), ArtifactKind::Plan);
        assert_eq!(ArtifactKind::for_role(Some(Role::Devops)), ArtifactKind::Config);
        assert_eq!(ArtifactKind::for_role(None), ArtifactKind::Code);
    }

    #[test]
    fn test_request_serialization() {
        let request = ExecutionRequest::new("Build API", Some(Role::Backend), Duration::from_secs(5))
            .with_deliverables(vec!["server.py".into()]);
        let json = serde_json::to_string(&request).unwrap();
        let parsed: ExecutionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.role_tag, Some(Role::Backend));
        assert_eq!(parsed.deliverables, vec!["server.py".to_string()]);
        assert_eq!(parsed.timeout, Duration::from_secs(5));
        assert!(!parsed.read_only);
    }

    #[test]
    fn test_read_only_defaults_when_absent() {
        let request = ExecutionRequest::new("Plan", None, Duration::from_secs(1)).read_only();
        assert!(request.read_only);

        let mut json = serde_json::to_value(&request).unwrap();
        json.as_object_mut().unwrap().remove("read_only");
        let parsed: ExecutionRequest = serde_json::from_value(json).unwrap();
        assert!(!parsed.read_only);
    }
}
