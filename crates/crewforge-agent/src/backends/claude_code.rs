use super::is_contained;
use crate::config::ExecutorConfig;
use crate::executor::{Artifact, ArtifactKind, ExecutionOutput, ExecutionRequest, TaskExecutor};
use crate::profiles::{build_task_prompt, profile_for};
use async_trait::async_trait;
use crewforge_core::{TaskError, TaskErrorKind};
use std::io::ErrorKind;
use std::process::Stdio;

/// Tools granted to read-only requests, regardless of role.
const READ_ONLY_TOOLS: &str = "Read,Glob,Grep";

/// Characters of unparseable stdout quoted in the error.
const STDOUT_EXCERPT_CHARS: usize = 500;

/// Claude Code CLI executor.
///
/// Runs the `claude` CLI in headless mode (`-p --output-format json`) inside
/// the output directory, with the role's system prompt and tool allow-list.
/// Uses the existing Claude Code login, so no API key is needed.
pub struct ClaudeCodeExecutor {
    config: ExecutorConfig,
}

impl ClaudeCodeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ExecutionRequest) -> tokio::process::Command {
        let prompt = build_task_prompt(request);
        let mut cmd = tokio::process::Command::new(&self.config.claude_binary);
        cmd.arg("-p").arg(&prompt);
        cmd.arg("--output-format").arg("json");

        let mut max_turns = self.config.max_turns;
        if let Some(role) = request.role_tag {
            let profile = profile_for(role);
            max_turns = max_turns.min(profile.max_turns);
            cmd.arg("--append-system-prompt").arg(&profile.system_prompt);
            if !request.read_only {
                cmd.arg("--allowedTools").arg(profile.allowed_tools.join(","));
            }
        }
        if request.read_only {
            cmd.arg("--allowedTools").arg(READ_ONLY_TOOLS);
        }
        cmd.arg("--max-turns").arg(max_turns.to_string());

        if let Some(model) = self.config.model.as_deref().filter(|m| *m != "default") {
            cmd.arg("--model").arg(model);
        }

        let permission_mode = if request.read_only {
            "plan"
        } else {
            self.config.permission_mode.as_str()
        };
        cmd.arg("--permission-mode").arg(permission_mode);
        cmd.arg("--no-session-persistence");
        cmd.current_dir(&self.config.output_dir);
        cmd.stdin(Stdio::null());
        // Dropping the future on timeout must not leave the CLI running.
        cmd.kill_on_drop(true);

        tracing::info!(
            task_id = %request.task_id,
            prompt_len = prompt.len(),
            read_only = request.read_only,
            "ClaudeCode: spawning claude CLI"
        );
        cmd
    }

    /// Load each declared deliverable the CLI left in the output directory.
    async fn read_deliverables(&self, request: &ExecutionRequest) -> Vec<Artifact> {
        let kind = ArtifactKind::for_role(request.role_tag);
        let mut artifacts = Vec::new();
        for deliverable in &request.deliverables {
            if !is_contained(deliverable) {
                tracing::warn!(task_id = %request.task_id, deliverable = %deliverable, "Deliverable escapes the output directory, skipped");
                continue;
            }
            let path = self.config.output_dir.join(deliverable);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => artifacts.push(Artifact::new(kind, content).with_path(deliverable)),
                Err(_) => {
                    tracing::warn!(task_id = %request.task_id, deliverable = %deliverable, "Deliverable not found after execution");
                }
            }
        }
        artifacts
    }
}

/// Result text extracted from the CLI's final JSON line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CliResult {
    pub text: String,
    pub num_turns: u64,
    pub cost_usd: Option<f64>,
}

/// Interpret `claude --output-format json` stdout.
pub(crate) fn parse_cli_output(stdout: &str) -> Result<CliResult, TaskError> {
    let result_json: serde_json::Value = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::InvalidOutput,
                format!(
                    "Could not parse Claude Code output as JSON. stdout: {}",
                    stdout.chars().take(STDOUT_EXCERPT_CHARS).collect::<String>()
                ),
            )
        })?;

    let is_error = result_json["is_error"].as_bool().unwrap_or(false);
    let text = result_json["result"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    if is_error {
        return Err(TaskError::failed(format!("Claude Code error: {text}")));
    }

    Ok(CliResult {
        text,
        num_turns: result_json["num_turns"].as_u64().unwrap_or(0),
        cost_usd: result_json["total_cost_usd"].as_f64(),
    })
}

#[async_trait]
impl TaskExecutor for ClaudeCodeExecutor {
    fn name(&self) -> &str {
        "claude_code"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| TaskError::failed(format!("cannot create output dir: {e}")))?;

        let output = self.command(request).output().await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TaskError::unavailable(format!(
                    "'{}' CLI not found. Is Claude Code installed?",
                    self.config.claude_binary
                ))
            } else {
                TaskError::failed(format!("Failed to run '{}' CLI: {e}", self.config.claude_binary))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(TaskError::failed(format!(
                "Claude Code CLI failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        let result = parse_cli_output(&stdout)?;
        if let Some(cost) = result.cost_usd {
            tracing::info!(
                task_id = %request.task_id,
                cost_usd = cost,
                num_turns = result.num_turns,
                "ClaudeCode: response received"
            );
        }

        let mut execution = ExecutionOutput::new(result.text.clone());
        execution.artifacts = self.read_deliverables(request).await;
        if execution.artifacts.is_empty() {
            execution = execution.with_artifact(Artifact::new(ArtifactKind::Report, result.text));
        }
        Ok(execution)
    }
}
