//! Capability collaborators for the Foreman orchestrator.
//!
//! - [`backends::Backend`]: turns a task description into generated files.
//!   Implementations drive the `claude` CLI, an arbitrary command, or a
//!   deterministic dry run, and [`FailoverBackend`] chains them with retries.
//! - [`vcs::VersionControl`]: branch, commit, push and pull-request
//!   operations, backed by libgit2 plus the GitHub REST API, or recorded
//!   locally.
//!
//! Which implementation runs is decided once, from configuration, by
//! [`build_backend`] and [`vcs::build_vcs`].

/// Backend trait and implementations.
pub mod backends;
/// Backend selection from configuration.
pub mod config;
/// Retry and fallback across backends.
pub mod failover;
/// Extraction of generated files from backend output.
pub mod files;
/// Version-control collaborators.
pub mod vcs;

pub use backends::{Backend, ExecutionOutput};
pub use config::{build_backend, BackendConfig, BackendKind};
pub use failover::{compute_backoff, FailoverBackend, RetryPolicy};
pub use vcs::{build_vcs, ChangeRequest, PullRequestRef, VcsConfig, VcsKind, VersionControl};
