use crate::task_graph::TaskGraph;
use crate::types::Task;
use async_trait::async_trait;
use crewforge_agent::{ExecutionRequest, TaskExecutor};
use crewforge_core::{CrewforgeError, CrewforgeResult, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// A submitted project: objective plus optional structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
}

impl ProjectSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn with_requirements<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.requirements.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn with_constraints<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.constraints.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn with_deliverable(mut self, deliverable: impl Into<String>) -> Self {
        self.deliverables.push(deliverable.into());
        self
    }

    pub fn with_deliverables<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.deliverables.extend(items.into_iter().map(Into::into));
        self
    }

    /// Structured text form of the project, one section per non-empty list.
    pub fn to_prompt(&self) -> String {
        let mut parts = vec![format!("Main Objective: {}", self.description)];
        for (title, items) in [
            ("Requirements", &self.requirements),
            ("Constraints", &self.constraints),
            ("Deliverables", &self.deliverables),
        ] {
            if items.is_empty() {
                continue;
            }
            parts.push(format!("{title}:"));
            parts.extend(items.iter().map(|item| format!("- {item}")));
        }
        parts.join("\n")
    }
}

/// Turns a project into an initial task graph.
///
/// The dispatcher does not care how the graph was produced, only that it
/// passed the graph's integrity checks.
#[async_trait]
pub trait Decomposer: Send + Sync {
    fn name(&self) -> &str;

    async fn decompose(&self, project: &ProjectSpec, max_attempts: u32) -> CrewforgeResult<TaskGraph>;
}

// ---------------------------------------------------------------------------
// Keyword strategy
// ---------------------------------------------------------------------------

static FRONTEND_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    vocabulary(r"frontend|front-end|ui|ux|react|vue|angular|svelte|html|css|javascript|typescript|web ?page|website|browser|component|dashboard|responsive")
});

static BACKEND_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    vocabulary(r"backend|back-end|api|rest(ful)?|graphql|server|database|sql|postgres(ql)?|sqlite|python|node(\.js)?|endpoint|auth(entication)?|crud|calculator|script|program|cli")
});

static DEVOPS_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    vocabulary(r"devops|docker(file)?|container|kubernetes|k8s|ci|cd|ci/cd|pipeline|deploy(ment)?|infrastructure|terraform|helm|monitoring")
});

static MANAGEMENT_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    vocabulary(r"plan(ning)?|roadmap|milestone|documentation|docs|guide|readme|coordinate|review|checklist")
});

/// Case-insensitive word-boundary alternation over a fixed term list.
#[allow(clippy::expect_used)]
fn vocabulary(alternation: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b({alternation})\b")).expect("vocabulary pattern compiles")
}

/// Role whose vocabulary matches `text`, checked in a fixed order.
fn role_for_text(text: &str) -> Option<Role> {
    if DEVOPS_TERMS.is_match(text) {
        Some(Role::Devops)
    } else if FRONTEND_TERMS.is_match(text) {
        Some(Role::Frontend)
    } else if BACKEND_TERMS.is_match(text) {
        Some(Role::Backend)
    } else if MANAGEMENT_TERMS.is_match(text) {
        Some(Role::ProjectManager)
    } else {
        None
    }
}

/// Role responsible for a deliverable, by file name or extension.
fn role_for_deliverable(name: &str) -> Option<Role> {
    let lower = name.to_lowercase();
    let path = Path::new(&lower);
    let base = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if base == "dockerfile" || base.starts_with("docker-compose") || base == "makefile" {
        return Some(Role::Devops);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "css" | "scss" | "js" | "jsx" | "ts" | "tsx" | "vue" | "svelte") => Some(Role::Frontend),
        Some("py" | "rs" | "go" | "java" | "rb" | "php" | "sql" | "kt" | "c" | "cpp") => Some(Role::Backend),
        Some("yml" | "yaml" | "sh" | "tf" | "toml" | "ini") => Some(Role::Devops),
        Some("md" | "rst" | "txt") => Some(Role::ProjectManager),
        _ => role_for_text(name),
    }
}

/// Default strategy: split by role vocabulary.
///
/// Produces a `plan` task for the project manager, one build task per
/// detected role depending on the plan, and an `integrate` task for the
/// project manager depending on every build task. When no role is detected
/// a single unassigned build task is emitted.
#[derive(Debug, Clone, Default)]
pub struct KeywordDecomposer;

impl KeywordDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Build the task list without wrapping it in a graph.
    pub fn plan_tasks(&self, project: &ProjectSpec, max_attempts: u32) -> Vec<Task> {
        let mut detected: Vec<Role> = Vec::new();
        let mut note = |role: Option<Role>| {
            if let Some(role) = role.filter(|r| *r != Role::ProjectManager) {
                if !detected.contains(&role) {
                    detected.push(role);
                }
            }
        };
        for (role, terms) in [
            (Role::Frontend, &*FRONTEND_TERMS),
            (Role::Backend, &*BACKEND_TERMS),
            (Role::Devops, &*DEVOPS_TERMS),
        ] {
            if terms.is_match(&project.description) {
                note(Some(role));
            }
        }
        for requirement in &project.requirements {
            note(role_for_text(requirement));
        }
        for deliverable in &project.deliverables {
            note(role_for_deliverable(deliverable));
        }
        detected.sort();

        // Route requirements and deliverables to build roles.
        let mut requirements: HashMap<Option<Role>, Vec<String>> = HashMap::new();
        let mut deliverables: HashMap<Option<Role>, Vec<String>> = HashMap::new();
        let build_key = |role: Option<Role>| match role {
            Some(Role::ProjectManager) => Some(Role::ProjectManager),
            Some(r) if detected.contains(&r) => Some(r),
            _ => None,
        };
        for requirement in &project.requirements {
            requirements
                .entry(build_key(role_for_text(requirement)))
                .or_default()
                .push(requirement.clone());
        }
        for deliverable in &project.deliverables {
            deliverables
                .entry(build_key(role_for_deliverable(deliverable)))
                .or_default()
                .push(deliverable.clone());
        }
        // Unrouted items are shared by every build task.
        let shared_requirements = requirements.remove(&None).unwrap_or_default();
        let mut unrouted_deliverables = deliverables.remove(&None).unwrap_or_default();

        let plan = Task::new(
            format!("Plan the project and split the work: {}", project.description),
            Some(Role::ProjectManager),
        )
        .with_requirements(project.requirements.clone())
        .with_constraints(project.constraints.clone())
        .with_max_attempts(max_attempts);
        let plan_id = plan.id;

        let build_roles: Vec<Option<Role>> = if detected.is_empty() {
            vec![None]
        } else {
            detected.iter().copied().map(Some).collect()
        };

        let mut builds = Vec::with_capacity(build_roles.len());
        for (index, role) in build_roles.into_iter().enumerate() {
            let description = match role {
                Some(r) => format!("Implement the {r} part of: {}", project.description),
                None => format!("Implement: {}", project.description),
            };
            let mut own_requirements = role
                .and_then(|r| requirements.remove(&Some(r)))
                .unwrap_or_default();
            own_requirements.extend(shared_requirements.iter().cloned());
            let mut own_deliverables = role
                .and_then(|r| deliverables.remove(&Some(r)))
                .unwrap_or_default();
            // The first build task owns deliverables no role claimed.
            if index == 0 {
                own_deliverables.append(&mut unrouted_deliverables);
            }
            builds.push(
                Task::new(description, role)
                    .with_requirements(own_requirements)
                    .with_constraints(project.constraints.clone())
                    .with_deliverables(own_deliverables)
                    .with_dependencies(vec![plan_id])
                    .with_max_attempts(max_attempts),
            );
        }

        let integrate = Task::new(
            format!("Integrate and verify the result of: {}", project.description),
            Some(Role::ProjectManager),
        )
        .with_requirements(requirements.remove(&Some(Role::ProjectManager)).unwrap_or_default())
        .with_constraints(project.constraints.clone())
        .with_deliverables(deliverables.remove(&Some(Role::ProjectManager)).unwrap_or_default())
        .with_dependencies(builds.iter().map(|t| t.id).collect())
        .with_max_attempts(max_attempts);

        let mut tasks = Vec::with_capacity(builds.len() + 2);
        tasks.push(plan);
        tasks.extend(builds);
        tasks.push(integrate);
        tasks
    }
}

#[async_trait]
impl Decomposer for KeywordDecomposer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn decompose(&self, project: &ProjectSpec, max_attempts: u32) -> CrewforgeResult<TaskGraph> {
        let tasks = self.plan_tasks(project, max_attempts);
        let mut graph = TaskGraph::new();
        graph.add_tasks(tasks)?;
        info!(tasks = graph.len(), "Keyword decomposition complete");
        Ok(graph)
    }
}

// ---------------------------------------------------------------------------
// Executor-driven plan
// ---------------------------------------------------------------------------

const PLAN_PROMPT: &str = "\
Analyze the following project task and split it into subtasks to be assigned \
to three coding agents: frontend_coder, backend_coder, and devops_coder.

Please output only JSON in the following format:
{
  \"subtasks\": [
    {
      \"id\": \"task_1\",
      \"description\": \"Task description\",
      \"assigned_to\": \"frontend_coder|backend_coder|devops_coder\",
      \"priority\": 1,
      \"dependencies\": []
    }
  ]
}

";

#[derive(Debug, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    subtasks: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    id: String,
    description: String,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    deliverables: Vec<String>,
}

fn default_priority() -> u32 {
    1
}

/// Parse a JSON plan embedded anywhere in `text` into tasks.
///
/// The outermost `{ ... }` span is taken as the document. Plan ids are
/// local strings and are mapped to fresh task ids; unknown or duplicate plan
/// ids are decomposition errors. Constraints of the project are copied onto
/// every task.
pub fn parse_plan(text: &str, project: &ProjectSpec, max_attempts: u32) -> CrewforgeResult<Vec<Task>> {
    let start = text
        .find('{')
        .ok_or_else(|| CrewforgeError::Decomposition("plan contains no JSON object".into()))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| CrewforgeError::Decomposition("plan JSON object is not closed".into()))?;
    let document: PlanDocument = serde_json::from_str(&text[start..=end])?;
    if document.subtasks.is_empty() {
        return Err(CrewforgeError::Decomposition("plan has no subtasks".into()));
    }

    let mut ids: HashMap<&str, Uuid> = HashMap::new();
    for entry in &document.subtasks {
        if ids.insert(entry.id.as_str(), Uuid::new_v4()).is_some() {
            return Err(CrewforgeError::Decomposition(format!(
                "plan id '{}' is used twice",
                entry.id
            )));
        }
    }

    let mut tasks = Vec::with_capacity(document.subtasks.len());
    for entry in &document.subtasks {
        let role = match entry.assigned_to.as_deref() {
            None | Some("") | Some("unassigned") => None,
            Some(name) => Some(name.parse::<Role>().map_err(CrewforgeError::Decomposition)?),
        };
        let mut dependencies = Vec::with_capacity(entry.dependencies.len());
        for dep in &entry.dependencies {
            let id = ids.get(dep.as_str()).ok_or_else(|| {
                CrewforgeError::Decomposition(format!(
                    "plan task '{}' depends on unknown id '{dep}'",
                    entry.id
                ))
            })?;
            dependencies.push(*id);
        }

        let mut task = Task::new(entry.description.clone(), role)
            .with_dependencies(dependencies)
            .with_constraints(project.constraints.clone())
            .with_deliverables(entry.deliverables.clone())
            .with_priority(entry.priority)
            .with_max_attempts(max_attempts);
        if let Some(id) = ids.get(entry.id.as_str()) {
            task.id = *id;
        }
        tasks.push(task);
    }
    Ok(tasks)
}

/// Asks an executor, acting as project manager, for a JSON plan.
///
/// Falls back to [`KeywordDecomposer`] when the executor fails or its output
/// cannot be parsed. Integrity errors in a parsed plan (such as a cycle) are
/// returned.
pub struct ExecutorPlanDecomposer {
    executor: Arc<dyn TaskExecutor>,
    timeout: Duration,
    fallback: KeywordDecomposer,
}

impl ExecutorPlanDecomposer {
    pub fn new(executor: Arc<dyn TaskExecutor>, timeout: Duration) -> Self {
        Self {
            executor,
            timeout,
            fallback: KeywordDecomposer,
        }
    }

    async fn request_plan(&self, project: &ProjectSpec) -> Option<String> {
        let prompt = format!("{PLAN_PROMPT}Main task:\n{}", project.to_prompt());
        let request =
            ExecutionRequest::new(prompt, Some(Role::ProjectManager), self.timeout).read_only();
        match tokio::time::timeout(self.timeout, self.executor.execute(&request)).await {
            Ok(Ok(output)) => Some(
                output
                    .artifacts
                    .iter()
                    .map(|a| a.content.as_str())
                    .chain(std::iter::once(output.summary.as_str()))
                    .find(|text| text.contains("\"subtasks\""))
                    .unwrap_or(output.summary.as_str())
                    .to_string(),
            ),
            Ok(Err(e)) => {
                warn!(executor = self.executor.name(), error = %e, "Plan request failed, using keyword decomposition");
                None
            }
            Err(_) => {
                warn!(executor = self.executor.name(), timeout_secs = self.timeout.as_secs(), "Plan request timed out, using keyword decomposition");
                None
            }
        }
    }
}

#[async_trait]
impl Decomposer for ExecutorPlanDecomposer {
    fn name(&self) -> &str {
        "executor_plan"
    }

    async fn decompose(&self, project: &ProjectSpec, max_attempts: u32) -> CrewforgeResult<TaskGraph> {
        let Some(text) = self.request_plan(project).await else {
            return self.fallback.decompose(project, max_attempts).await;
        };

        let tasks = match parse_plan(&text, project, max_attempts) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Unusable plan, using keyword decomposition");
                return self.fallback.decompose(project, max_attempts).await;
            }
        };

        let mut graph = TaskGraph::new();
        graph.add_tasks(tasks)?;
        info!(tasks = graph.len(), "Executor plan decomposition complete");
        Ok(graph)
    }
}
