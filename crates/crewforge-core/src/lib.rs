//! Core types and error definitions for the crewforge coordination engine.
//!
//! This crate provides the foundational types shared across all crewforge
//! crates: the unified error enum, the task-level failure record reported by
//! executors, and the closed set of agent roles.
//!
//! # Main types
//!
//! - [`CrewforgeError`] — Unified error enum for all crewforge subsystems.
//! - [`CrewforgeResult`] — Convenience alias for `Result<T, CrewforgeError>`.
//! - [`GraphIntegrityError`] — Structural violations rejected at graph construction.
//! - [`TaskError`] — A task-level failure (executor failure, timeout, run deadline).
//! - [`Role`] — Agent specialization used for capability matching.

/// Error types shared by every crate in the workspace.
pub mod error;
/// Agent roles and their capability tags.
pub mod role;

pub use error::{
    CrewforgeError, CrewforgeResult, GraphIntegrityError, TaskError, TaskErrorKind,
};
pub use role::Role;
