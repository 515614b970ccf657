use super::is_contained;
use crate::config::ExecutorConfig;
use crate::executor::{Artifact, ArtifactKind, ExecutionOutput, ExecutionRequest, TaskExecutor};
use async_trait::async_trait;
use crewforge_core::TaskError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deterministic executor used when no real code-generation backend is
/// available.
///
/// Writes a minimal program for every declared deliverable, chosen by file
/// extension. With no deliverables, a request that mentions "hello world"
/// produces `main.py`; anything else yields a summary only. Read-only
/// requests never touch the output directory.
pub struct FallbackExecutor {
    output_dir: PathBuf,
    latency: Duration,
}

impl FallbackExecutor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.output_dir.clone()).with_latency(Duration::from_millis(config.fallback_latency_ms))
    }

    /// Simulated processing time before any output is written.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn targets(request: &ExecutionRequest) -> Vec<String> {
        if request.read_only {
            return Vec::new();
        }
        if !request.deliverables.is_empty() {
            return request.deliverables.clone();
        }
        let mentions_hello = std::iter::once(&request.description)
            .chain(request.requirements.iter())
            .any(|s| s.to_lowercase().contains("hello world"));
        if mentions_hello {
            vec!["main.py".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Minimal file content for a deliverable, by extension or well-known name.
pub(crate) fn template_for(file_name: &str) -> String {
    let lower = file_name.to_lowercase();
    let base = Path::new(&lower)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    if base == "dockerfile" {
        return "FROM python:3.12-slim\nWORKDIR /app\nCOPY . .\nCMD [\"python\", \"main.py\"]\n".to_string();
    }

    match Path::new(&lower).extension().and_then(|e| e.to_str()) {
        Some("py") => PYTHON_HELLO.to_string(),
        Some("rs") => "fn main() {\n    println!(\"Hello, World!\");\n}\n".to_string(),
        Some("js") | Some("ts") => "console.log(\"Hello, World!\");\n".to_string(),
        Some("html") => "<!DOCTYPE html>\n<html>\n  <head><title>Hello</title></head>\n  <body><h1>Hello, World!</h1></body>\n</html>\n".to_string(),
        Some("css") => "body {\n  font-family: sans-serif;\n}\n".to_string(),
        Some("sh") => "#!/bin/sh\necho \"Hello, World!\"\n".to_string(),
        Some("yml") | Some("yaml") => "# generated placeholder\nversion: 1\n".to_string(),
        Some("json") => "{}\n".to_string(),
        Some("md") => format!("# {file_name}\n\nGenerated placeholder.\n"),
        _ => format!("Placeholder for {file_name}\n"),
    }
}

const PYTHON_HELLO: &str = r#"#!/usr/bin/env python3
"""Simple Hello World program."""


def greet(name=None):
    if name is None or not str(name).strip():
        name = "World"
    return f"Hello, {str(name).strip()}!"


def main():
    print(greet())


if __name__ == "__main__":
    main()
"#;

#[async_trait]
impl TaskExecutor for FallbackExecutor {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let targets = Self::targets(request);
        let kind = ArtifactKind::for_role(request.role_tag);
        let mut output = ExecutionOutput::default();

        for target in &targets {
            if !is_contained(target) {
                return Err(TaskError::failed(format!(
                    "deliverable '{target}' escapes the output directory"
                )));
            }
            let path = self.output_dir.join(target);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TaskError::failed(format!("cannot create {}: {e}", parent.display())))?;
            }
            let content = template_for(target);
            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| TaskError::failed(format!("cannot write {}: {e}", path.display())))?;
            tracing::debug!(task_id = %request.task_id, file = %path.display(), "Fallback: wrote deliverable");
            output = output.with_artifact(Artifact::new(kind, content).with_path(target.clone()));
        }

        output.summary = if request.read_only {
            "Fallback executor: read-only request, nothing written.".to_string()
        } else if targets.is_empty() {
            "Fallback executor: no code-generation backend available; no deliverables were requested."
                .to_string()
        } else {
            format!(
                "Fallback executor wrote {} file(s) to {}: {}",
                targets.len(),
                self.output_dir.display(),
                targets.join(", ")
            )
        };
        Ok(output)
    }
}
