use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Specialization of an agent in the crew.
///
/// Roles are a closed set; tasks select an agent by matching the role tag
/// against the agent's capability tags rather than by inspecting its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Plans the project and verifies the integrated result.
    ProjectManager,
    /// UI and client-side work.
    Frontend,
    /// Services, APIs and data.
    Backend,
    /// Containers, CI/CD and infrastructure.
    Devops,
}

impl Role {
    /// All roles, in the order the default roster registers them.
    pub const ALL: [Role; 4] = [
        Role::ProjectManager,
        Role::Frontend,
        Role::Backend,
        Role::Devops,
    ];

    /// The capability tag that matches this role.
    pub fn as_tag(self) -> &'static str {
        match self {
            Role::ProjectManager => "project_manager",
            Role::Frontend => "frontend",
            Role::Backend => "backend",
            Role::Devops => "devops",
        }
    }

    /// Default agent id for this role in the standard roster.
    pub fn default_agent_id(self) -> &'static str {
        match self {
            Role::ProjectManager => "project_manager",
            Role::Frontend => "frontend_coder",
            Role::Backend => "backend_coder",
            Role::Devops => "devops_coder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "project_manager" | "manager" | "pm" => Ok(Role::ProjectManager),
            "frontend" | "frontend_coder" => Ok(Role::Frontend),
            "backend" | "backend_coder" => Ok(Role::Backend),
            "devops" | "devops_coder" => Ok(Role::Devops),
            other => Err(format!("unknown role: {other}")),
        }
    }
}
