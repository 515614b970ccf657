//! Task executor boundary for crewforge.
//!
//! The coordination engine never looks inside code generation; it calls a
//! [`TaskExecutor`] with a task's description, requirements, constraints and
//! timeout, and gets back artifacts or a [`crewforge_core::TaskError`].
//!
//! # Main types
//!
//! - [`TaskExecutor`] — The async capability every backend implements.
//! - [`ClaudeCodeExecutor`] — Full-capability backend driving the `claude` CLI.
//! - [`FallbackExecutor`] — Deterministic minimal output when no backend is available.
//! - [`FailoverExecutor`] — Chains executors with capped exponential backoff.
//! - [`ExecutorConfig`] — Backend selection and CLI options.

pub mod backends;
pub mod config;
pub mod executor;
pub mod failover;
pub mod profiles;

pub use backends::{build_executor, ClaudeCodeExecutor, FallbackExecutor};
pub use config::{ExecutorBackend, ExecutorConfig};
pub use executor::{Artifact, ArtifactKind, ExecutionOutput, ExecutionRequest, TaskExecutor};
pub use failover::{FailoverExecutor, RetryPolicy};
pub use profiles::{build_task_prompt, profile_for, RoleProfile};
