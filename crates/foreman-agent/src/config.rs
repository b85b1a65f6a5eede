use crate::backends::{Backend, ClaudeCodeBackend, CommandBackend, DryRunBackend};
use crate::failover::{FailoverBackend, RetryPolicy};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which code-generation backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The local `claude` CLI in headless mode (-p --output-format json).
    /// No API key needed, uses the operator's Claude Code session.
    ClaudeCode,
    /// Any CLI taking the prompt as an argument.
    Command,
    /// Deterministic scaffolding, no external calls.
    #[default]
    DryRun,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::ClaudeCode => write!(f, "claude-code"),
            BackendKind::Command => write!(f, "command"),
            BackendKind::DryRun => write!(f, "dry-run"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "claude-code" | "claude" => Ok(BackendKind::ClaudeCode),
            "command" | "cmd" => Ok(BackendKind::Command),
            "dry-run" | "dryrun" => Ok(BackendKind::DryRun),
            other => Err(ForemanError::Config(format!("unknown backend kind '{other}'"))),
        }
    }
}

/// Backend configuration, the `[backend]` table of `foreman.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend implementation.
    #[serde(default)]
    pub kind: BackendKind,
    /// Model passed to the CLI, when it supports one.
    #[serde(default)]
    pub model: Option<String>,
    /// Agentic turn limit for the `claude` CLI.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Executable to run (required for `command`, overrides `claude`).
    #[serde(default)]
    pub program: Option<String>,
    /// Arguments, may contain `{prompt}` and `{output_dir}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Backends tried in order when this one fails.
    #[serde(default)]
    pub fallbacks: Vec<BackendConfig>,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_turns() -> u32 {
    20
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            model: None,
            max_turns: default_max_turns(),
            program: None,
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            fallbacks: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BackendConfig {
    /// A default configuration of the given kind.
    pub fn of_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

fn build_single(config: &BackendConfig) -> ForemanResult<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::ClaudeCode => Arc::new(ClaudeCodeBackend::new(config.clone())),
        BackendKind::Command => Arc::new(CommandBackend::new(config)?),
        BackendKind::DryRun => Arc::new(DryRunBackend::new()),
    };
    Ok(backend)
}

/// Build the backend chain described by `config`.
///
/// The primary backend comes first, followed by its fallbacks (their own
/// nested fallbacks are ignored). The chain is always wrapped in a
/// [`FailoverBackend`] so transient errors get retried with backoff.
pub fn build_backend(config: &BackendConfig) -> ForemanResult<Arc<dyn Backend>> {
    let mut chain = vec![build_single(config)?];
    for fallback in &config.fallbacks {
        chain.push(build_single(fallback)?);
    }
    tracing::info!(
        primary = %config.kind,
        fallbacks = config.fallbacks.len(),
        "Backend chain configured"
    );
    Ok(Arc::new(FailoverBackend::new(chain, config.retry.clone())?))
}
