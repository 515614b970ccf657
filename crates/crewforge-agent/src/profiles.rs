use crate::executor::ExecutionRequest;
use crewforge_core::Role;
use serde::{Deserialize, Serialize};

/// Tools every role gets.
const BASE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// Configuration for a specialized agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleProfile {
    pub role: Role,
    pub system_prompt: String,
    /// Tool names passed to the executor backend.
    pub allowed_tools: Vec<String>,
    /// Capability tags a default agent of this role advertises.
    pub capability_tags: Vec<String>,
    pub max_turns: u32,
}

/// The built-in profile for a role.
pub fn profile_for(role: Role) -> RoleProfile {
    match role {
        Role::ProjectManager => project_manager_profile(),
        Role::Frontend => frontend_profile(),
        Role::Backend => backend_profile(),
        Role::Devops => devops_profile(),
    }
}

/// Profiles for all four roles, in registration order.
pub fn default_profiles() -> Vec<RoleProfile> {
    Role::ALL.into_iter().map(profile_for).collect()
}

fn tools(extra: &[&str]) -> Vec<String> {
    BASE_TOOLS
        .iter()
        .chain(extra.iter())
        .map(|t| (*t).to_string())
        .collect()
}

fn tags(role: Role, extra: &[&str]) -> Vec<String> {
    std::iter::once(role.as_tag())
        .chain(extra.iter().copied())
        .map(str::to_string)
        .collect()
}

fn project_manager_profile() -> RoleProfile {
    RoleProfile {
        role: Role::ProjectManager,
        system_prompt: PROJECT_MANAGER_PROMPT.to_string(),
        allowed_tools: tools(&["WebSearch", "WebFetch"]),
        capability_tags: tags(Role::ProjectManager, &["planning", "integration"]),
        max_turns: 10,
    }
}

fn frontend_profile() -> RoleProfile {
    RoleProfile {
        role: Role::Frontend,
        system_prompt: FRONTEND_PROMPT.to_string(),
        allowed_tools: tools(&["MultiEdit", "NotebookEdit"]),
        capability_tags: tags(Role::Frontend, &["ui", "react", "css"]),
        max_turns: 10,
    }
}

fn backend_profile() -> RoleProfile {
    RoleProfile {
        role: Role::Backend,
        system_prompt: BACKEND_PROMPT.to_string(),
        allowed_tools: tools(&["MultiEdit", "NotebookEdit"]),
        capability_tags: tags(Role::Backend, &["api", "database"]),
        max_turns: 10,
    }
}

fn devops_profile() -> RoleProfile {
    RoleProfile {
        role: Role::Devops,
        system_prompt: DEVOPS_PROMPT.to_string(),
        allowed_tools: tools(&["TodoWrite"]),
        capability_tags: tags(Role::Devops, &["docker", "ci"]),
        max_turns: 10,
    }
}

/// Render the prompt sent to a backend for one task.
pub fn build_task_prompt(request: &ExecutionRequest) -> String {
    let role = request
        .role_tag
        .map_or_else(|| "general engineer".to_string(), |r| r.to_string());

    let mut prompt = format!("As a {role}, please execute the following task:\n\nTask: {}\n", request.description);

    for (title, items) in [
        ("Requirements", &request.requirements),
        ("Constraints", &request.constraints),
        ("Deliverables", &request.deliverables),
    ] {
        if items.is_empty() {
            continue;
        }
        prompt.push_str(&format!("\n{title}:\n"));
        for item in items {
            prompt.push_str(&format!("- {item}\n"));
        }
    }

    prompt.push_str(
        "\nUse file operations (Read, Write, Edit), command execution (Bash) and \
         file search (Glob, Grep) as needed.\n\
         Write every deliverable into the current working directory.\n\
         Report the execution results in detail.\n",
    );
    prompt
}

const PROJECT_MANAGER_PROMPT: &str = "\
You are the project manager of a small software crew. \
Analyze the project, split it into work for the frontend, backend and devops \
engineers, and verify the integrated result at the end.

Rules:
1. Break work into clear, independent subtasks when possible.
2. Declare dependencies between subtasks explicitly.
3. When verifying, check that every declared deliverable exists and works together.
";

const FRONTEND_PROMPT: &str = "\
You are an expert in React, Vue.js, Angular and other frontend technologies. \
Perform code design, implementation, and debugging. Write maintainable code \
and actively use file operations, command execution, and code editing tools.
";

const BACKEND_PROMPT: &str = "\
You are an expert in Python, Node.js, Java and other backend technologies. \
Perform code design, implementation, and debugging. Write maintainable code \
and actively use file operations, command execution, and code editing tools.
";

const DEVOPS_PROMPT: &str = "\
You are an expert in Docker, Kubernetes, CI/CD and other infrastructure technologies. \
Perform configuration design, implementation, and debugging. Actively use \
file operations, command execution, and code editing tools.
";
