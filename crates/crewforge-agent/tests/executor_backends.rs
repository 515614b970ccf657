//! Integration tests for crewforge-agent: backend selection, failover to the
//! deterministic fallback, and prompt rendering.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crewforge_agent::{
    build_executor, build_task_prompt, ArtifactKind, ExecutionRequest, ExecutorBackend,
    ExecutorConfig, FailoverExecutor, FallbackExecutor, RetryPolicy, TaskExecutor,
    ClaudeCodeExecutor,
};
use crewforge_core::{Role, TaskErrorKind};
use std::time::Duration;

fn config_in(dir: &std::path::Path) -> ExecutorConfig {
    ExecutorConfig {
        claude_binary: "crewforge-missing-claude-binary".to_string(),
        output_dir: dir.to_path_buf(),
        retry_policy: RetryPolicy {
            max_retries: 0,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        },
        ..ExecutorConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_backend_degrades_to_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let executor = build_executor(&config_in(tmp.path()));
    assert_eq!(executor.name(), "failover");

    let request = ExecutionRequest::new("Create a Hello World program", Some(Role::Backend), Duration::from_secs(5))
        .with_deliverables(vec!["hello.py".to_string()]);
    let output = executor.execute(&request).await.unwrap();

    assert_eq!(output.artifacts.len(), 1);
    assert_eq!(output.artifacts[0].kind, ArtifactKind::Code);
    assert!(tmp.path().join("hello.py").exists());
}

#[tokio::test]
async fn test_claude_only_backend_reports_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config_in(tmp.path());
    config.backend = ExecutorBackend::ClaudeCode;
    let executor = build_executor(&config);

    let request = ExecutionRequest::new("Anything", None, Duration::from_secs(5));
    let err = executor.execute(&request).await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::Unavailable);
}

#[tokio::test]
async fn test_explicit_failover_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let failover = FailoverExecutor::new(
        vec![
            Box::new(ClaudeCodeExecutor::new(config.clone())),
            Box::new(FallbackExecutor::new(tmp.path())),
        ],
        config.retry_policy.clone(),
    );

    let request = ExecutionRequest::new("Ship infra", Some(Role::Devops), Duration::from_secs(5))
        .with_deliverables(vec!["Dockerfile".to_string()]);
    let output = failover.execute(&request).await.unwrap();
    assert_eq!(output.artifacts[0].kind, ArtifactKind::Config);
    let dockerfile = std::fs::read_to_string(tmp.path().join("Dockerfile")).unwrap();
    assert!(dockerfile.starts_with("FROM"));
}

// ---------------------------------------------------------------------------
// Fallback latency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_fallback_latency_is_observed() {
    let tmp = tempfile::tempdir().unwrap();
    let executor = FallbackExecutor::new(tmp.path()).with_latency(Duration::from_secs(2));
    let request = ExecutionRequest::new("Plan", Some(Role::ProjectManager), Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    executor.execute(&request).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

#[test]
fn test_prompt_lists_constraints() {
    let mut request = ExecutionRequest::new("Build the UI", Some(Role::Frontend), Duration::from_secs(1));
    request.constraints = vec!["No external CDNs".to_string()];
    let prompt = build_task_prompt(&request);
    assert!(prompt.starts_with("As a frontend"));
    assert!(prompt.contains("Constraints:\n- No external CDNs"));
}
