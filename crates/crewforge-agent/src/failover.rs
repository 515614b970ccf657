use crate::executor::{ExecutionOutput, ExecutionRequest, TaskExecutor};
use async_trait::async_trait;
use crewforge_core::{TaskError, TaskErrorKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for failover across executor backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Determines whether a backend failure is transient and worth retrying on
/// the same backend.
///
/// Timeouts and failures mentioning rate limits or server errors (429, 5xx,
/// "overloaded") are transient. A missing backend, unreadable output, and
/// cancellation are not.
pub fn is_retryable(err: &TaskError) -> bool {
    match err.kind {
        TaskErrorKind::Timeout => true,
        TaskErrorKind::Failed => {
            let lower = err.detail.to_lowercase();
            if lower.contains("400") {
                return false;
            }
            lower.contains("429")
                || lower.contains("timeout")
                || lower.contains("overloaded")
                || lower.contains("5xx")
                || lower.contains("500")
                || lower.contains("502")
                || lower.contains("503")
                || lower.contains("504")
        }
        _ => false,
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// A [`TaskExecutor`] that wraps multiple executors and performs automatic
/// failover with exponential-backoff retries.
///
/// For each request it tries executors in order. Within each executor it
/// retries up to `max_retries` times for transient errors. If all retries are
/// exhausted, or a non-retryable error is encountered (for example the
/// backend is not installed), it moves to the next executor. If every
/// executor fails, the last error is returned.
pub struct FailoverExecutor {
    executors: Vec<Box<dyn TaskExecutor>>,
    policy: RetryPolicy,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverExecutor {
    /// Create a new failover executor with the given executors and retry policy.
    pub fn new(executors: Vec<Box<dyn TaskExecutor>>, policy: RetryPolicy) -> Self {
        Self {
            executors,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl TaskExecutor for FailoverExecutor {
    fn name(&self) -> &str {
        "failover"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
        let mut last_err: Option<TaskError> = None;

        for executor in &self.executors {
            for attempt in 0..=self.policy.max_retries {
                match executor.execute(request).await {
                    Ok(output) => return Ok(output),
                    Err(e) => {
                        if !is_retryable(&e) {
                            warn!(
                                task_id = %request.task_id,
                                executor = executor.name(),
                                attempt,
                                error = %e,
                                "Non-retryable executor error, moving to next executor"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(
                                task_id = %request.task_id,
                                executor = executor.name(),
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Retryable executor error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TaskError::unavailable("no executors configured")))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Returns a scripted sequence of results, then errors.
    struct ScriptedExecutor {
        results: tokio::sync::Mutex<Vec<Result<ExecutionOutput, TaskError>>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedExecutor {
        fn boxed(results: Vec<Result<ExecutionOutput, TaskError>>) -> (Box<dyn TaskExecutor>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let executor = Self {
                results: tokio::sync::Mutex::new(results),
                calls: calls.clone(),
            };
            (Box::new(executor), calls)
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutput, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(TaskError::failed("scripted: no more results"))
            } else {
                results.remove(0)
            }
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("task", None, Duration::from_secs(1))
    }

    fn no_sleep() -> Option<SleepFn> {
        Some(Box::new(|_| Box::pin(async {})))
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_try() {
        let (executor, calls) = ScriptedExecutor::boxed(vec![
            Err(TaskError::failed("429 Too Many Requests")),
            Ok(ExecutionOutput::new("ok")),
        ]);
        let failover = FailoverExecutor {
            executors: vec![executor],
            policy: instant_policy(),
            sleep_fn: no_sleep(),
        };

        let output = failover.execute(&request()).await.unwrap();
        assert_eq!(output.summary, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_moves_to_fallback_immediately() {
        let (primary, primary_calls) =
            ScriptedExecutor::boxed(vec![Err(TaskError::unavailable("claude not installed"))]);
        let (fallback, _) = ScriptedExecutor::boxed(vec![Ok(ExecutionOutput::new("fallback ok"))]);
        let failover = FailoverExecutor {
            executors: vec![primary, fallback],
            policy: instant_policy(),
            sleep_fn: no_sleep(),
        };

        let output = failover.execute(&request()).await.unwrap();
        assert_eq!(output.summary, "fallback ok");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_executors_fail_returns_last_error() {
        let (first, _) = ScriptedExecutor::boxed(vec![Err(TaskError::failed("500 boom")); 4]);
        let (second, _) = ScriptedExecutor::boxed(vec![Err(TaskError::failed("503 unavailable")); 4]);
        let failover = FailoverExecutor {
            executors: vec![first, second],
            policy: instant_policy(),
            sleep_fn: no_sleep(),
        };

        let err = failover.execute(&request()).await.unwrap_err();
        assert!(err.detail.contains("503"), "expected last error, got {err}");
    }

    #[tokio::test]
    async fn backoff_delays_are_requested() {
        let delays = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = delays.clone();
        let (executor, _) = ScriptedExecutor::boxed(vec![
            Err(TaskError::timeout("slow")),
            Err(TaskError::timeout("slow")),
            Ok(ExecutionOutput::new("ok")),
        ]);
        let failover = FailoverExecutor {
            executors: vec![executor],
            policy: RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 100,
                backoff_max_ms: 1_000,
            },
            sleep_fn: Some(Box::new(move |ms| {
                recorded.lock().unwrap().push(ms);
                Box::pin(async {})
            })),
        };

        failover.execute(&request()).await.unwrap();
        assert_eq!(*delays.lock().unwrap(), vec![100, 200]);
    }

    #[tokio::test]
    async fn empty_failover_is_unavailable() {
        let failover = FailoverExecutor::new(Vec::new(), RetryPolicy::default());
        let err = failover.execute(&request()).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Unavailable);
    }

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        };

        assert_eq!(compute_backoff(&policy, 0), 500);
        assert_eq!(compute_backoff(&policy, 1), 1000);
        assert_eq!(compute_backoff(&policy, 3), 4000);
        assert_eq!(compute_backoff(&policy, 6), 30_000);
    }

    #[test]
    fn is_retryable_classification() {
        assert!(is_retryable(&TaskError::failed("429 Too Many Requests")));
        assert!(is_retryable(&TaskError::failed("API overloaded")));
        assert!(is_retryable(&TaskError::timeout("took too long")));
        assert!(!is_retryable(&TaskError::failed("400 Bad Request")));
        assert!(!is_retryable(&TaskError::failed("syntax error in generated code")));
        assert!(!is_retryable(&TaskError::unavailable("not installed")));
    }
}
