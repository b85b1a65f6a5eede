//! Operator intervention requests with a deadline.
//!
//! The run never blocks indefinitely on a human: every request goes through
//! [`request_with_deadline`], which falls back to a configured default action
//! once the deadline passes or the channel fails.

use crate::ForemanResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Risk level attached to an intervention request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Informational; the default action is almost always fine.
    Low,
    /// The task may need to be skipped.
    Medium,
    /// The run may need to halt.
    High,
    /// Data or security at stake.
    Critical,
}

/// What the operator (or the timeout default) decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionAction {
    /// Try the failed step again.
    Retry,
    /// Give up on the task and continue with the rest of the run.
    Skip,
    /// Stop the whole run.
    Halt,
}

impl InterventionAction {
    /// Parse user input; `None` when the input names no action.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "r" | "retry" => Some(InterventionAction::Retry),
            "s" | "skip" => Some(InterventionAction::Skip),
            "h" | "halt" | "stop" => Some(InterventionAction::Halt),
            _ => None,
        }
    }
}

impl std::fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterventionAction::Retry => write!(f, "retry"),
            InterventionAction::Skip => write!(f, "skip"),
            InterventionAction::Halt => write!(f, "halt"),
        }
    }
}

/// A request sent to an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRequest {
    /// Task the request is about.
    pub task_id: String,
    /// One-line summary of what went wrong.
    pub summary: String,
    /// How risky the situation is.
    pub risk_level: RiskLevel,
    /// Error text and any other context for the operator.
    pub context: String,
}

impl InterventionRequest {
    /// Build a request for the given task.
    pub fn new(
        task_id: impl Into<String>,
        summary: impl Into<String>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            summary: summary.into(),
            risk_level,
            context: String::new(),
        }
    }

    /// Attach context text.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// Where the final action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// The channel answered before the deadline.
    Operator,
    /// The deadline passed; the default action applied.
    Timeout,
    /// The channel returned an error; the default action applied.
    Unavailable,
}

/// Result of a timed intervention request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionOutcome {
    /// The action to take.
    pub action: InterventionAction,
    /// Who decided.
    pub source: DecisionSource,
}

/// Channel through which intervention requests reach an operator.
/// Implementations can be CLI prompts, chat bots, dashboards, etc.
#[async_trait]
pub trait InterventionChannel: Send + Sync {
    /// Ask for a decision. May take arbitrarily long; callers bound it with
    /// [`request_with_deadline`].
    async fn request_intervention(
        &self,
        request: InterventionRequest,
    ) -> ForemanResult<InterventionAction>;
}

/// Ask `channel` for a decision, applying `default_action` if no answer
/// arrives within `deadline` or the channel fails.
pub async fn request_with_deadline(
    channel: &dyn InterventionChannel,
    request: InterventionRequest,
    deadline: Duration,
    default_action: InterventionAction,
) -> InterventionOutcome {
    let task_id = request.task_id.clone();
    info!(
        task_id = %task_id,
        risk = ?request.risk_level,
        deadline_secs = deadline.as_secs(),
        "Intervention requested"
    );

    match tokio::time::timeout(deadline, channel.request_intervention(request)).await {
        Ok(Ok(action)) => {
            info!(task_id = %task_id, action = %action, "Intervention answered");
            InterventionOutcome {
                action,
                source: DecisionSource::Operator,
            }
        }
        Ok(Err(e)) => {
            warn!(
                task_id = %task_id,
                error = %e,
                default = %default_action,
                "Intervention channel failed, applying default action"
            );
            InterventionOutcome {
                action: default_action,
                source: DecisionSource::Unavailable,
            }
        }
        Err(_) => {
            warn!(
                task_id = %task_id,
                default = %default_action,
                "Intervention timed out, applying default action"
            );
            InterventionOutcome {
                action: default_action,
                source: DecisionSource::Timeout,
            }
        }
    }
}

/// Channel that always answers with the same action.
/// Used for unattended runs and in tests.
pub struct FixedActionChannel {
    action: InterventionAction,
}

impl FixedActionChannel {
    /// Create a channel that always answers `action`.
    pub fn new(action: InterventionAction) -> Self {
        Self { action }
    }
}

#[async_trait]
impl InterventionChannel for FixedActionChannel {
    async fn request_intervention(
        &self,
        request: InterventionRequest,
    ) -> ForemanResult<InterventionAction> {
        info!(
            task_id = %request.task_id,
            action = %self.action,
            "Auto-deciding intervention (no operator configured)"
        );
        Ok(self.action)
    }
}
