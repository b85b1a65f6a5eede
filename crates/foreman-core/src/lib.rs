//! Core types and error definitions for the Foreman orchestration core.
//!
//! This crate provides the foundational types shared across all Foreman
//! crates: the unified error enum, its severity taxonomy, and the timed
//! intervention channel used whenever the run needs an operator decision.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all Foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.
//! - [`ErrorSeverity`] — Transient / recoverable / critical classification.
//! - [`intervention::InterventionChannel`] — Operator decisions with a deadline.

/// Timed operator-intervention requests.
pub mod intervention;

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Foreman workspace.
///
/// Each variant corresponds to a subsystem or a failure class that the
/// orchestrator handles differently.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// A generic orchestration failure.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A task referenced a dependency that is not in the graph.
    #[error("Invalid dependency: task '{task}' depends on unknown task '{dependency}'")]
    InvalidDependency {
        /// The task being enqueued.
        task: String,
        /// The dependency identifier that could not be resolved.
        dependency: String,
    },

    /// A task identifier was enqueued twice.
    #[error("Duplicate task: '{0}' is already in the graph")]
    DuplicateTask(String),

    /// A task identifier is not known to the graph.
    #[error("Unknown task: '{0}'")]
    UnknownTask(String),

    /// A status change that the task lifecycle does not allow.
    #[error("Invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        /// The task whose status was being changed.
        task: String,
        /// Current status label.
        from: String,
        /// Requested status label.
        to: String,
    },

    /// A request on the message bus received no correlated response in time.
    #[error("Response timeout: no reply for correlation {correlation_id} within {timeout_ms}ms")]
    ResponseTimeout {
        /// Correlation identifier of the abandoned request.
        correlation_id: String,
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A message could not be delivered.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The code-generation backend failed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Transient failures persisted past the retry ceiling.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made across all backends.
        attempts: u32,
        /// Text of the last error observed.
        last_error: String,
    },

    /// The version-control collaborator failed.
    #[error("VCS error: {0}")]
    Vcs(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Run state persistence or lookup failed.
    #[error("Session error: {0}")]
    Session(String),

    /// Persisted data failed an integrity check.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A hard resource ceiling was hit (disk, memory, quota).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A security-relevant failure.
    #[error("Security error: {0}")]
    Security(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

/// How an error is handled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Network timeouts and rate limiting: retried with exponential backoff.
    Transient,
    /// Validation errors, missing dependencies, merge conflicts: resolved
    /// through a fallback chain or a timed intervention request.
    Recoverable,
    /// Resource exhaustion, corruption, security failures: never retried.
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Transient => write!(f, "TRANSIENT"),
            ErrorSeverity::Recoverable => write!(f, "RECOVERABLE"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ForemanError {
    /// Classify this error into the transient / recoverable / critical taxonomy.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ForemanError::ResponseTimeout { .. } => ErrorSeverity::Transient,
            ForemanError::Http(msg) | ForemanError::Execution(msg) => {
                if looks_transient(msg) {
                    ErrorSeverity::Transient
                } else {
                    ErrorSeverity::Recoverable
                }
            }
            ForemanError::Corruption(_)
            | ForemanError::ResourceExhausted(_)
            | ForemanError::Security(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Recoverable,
        }
    }

    /// Shorthand for `self.severity() == ErrorSeverity::Transient`.
    pub fn is_transient(&self) -> bool {
        self.severity() == ErrorSeverity::Transient
    }

    /// Shorthand for `self.severity() == ErrorSeverity::Critical`.
    pub fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

/// Returns `true` for messages naming a timeout, rate limit or 5xx status.
///
/// A 400 anywhere in the message wins over the other patterns: bad requests
/// are not expected to succeed on retry.
fn looks_transient(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    if lower.contains("400") {
        return false;
    }
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("5xx")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
}
