//! Stopping conditions evaluated on every health sample.
//!
//! Rules are checked in a fixed order and the first match wins. A user
//! stop bypasses every other check; the token limit is checked before
//! anything else in the same tick.

use crate::scheduler::Scheduler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltReason {
    /// Every task reached a terminal status.
    AllTasksDone,
    /// The operator asked to stop.
    UserStopped,
    /// Token budget used up.
    TokenLimit,
    /// Wall-clock budget used up.
    RuntimeLimit,
    /// Context window full and recovery failed.
    ContextOverflow,
    /// Too many failed tasks.
    HighErrorRate,
    /// No progress for too long.
    Stagnation,
    /// Improvement cycles stopped paying off.
    DiminishingReturns,
    /// A critical error.
    CriticalError,
}

impl HaltReason {
    /// Process exit code for this reason.
    pub fn exit_code(self) -> i32 {
        match self {
            HaltReason::AllTasksDone | HaltReason::DiminishingReturns => 0,
            HaltReason::UserStopped => 2,
            HaltReason::TokenLimit => 3,
            HaltReason::RuntimeLimit => 4,
            HaltReason::ContextOverflow => 5,
            HaltReason::HighErrorRate => 6,
            HaltReason::Stagnation => 7,
            HaltReason::CriticalError => 8,
        }
    }

    /// Label as written in reports and events.
    pub fn as_str(self) -> &'static str {
        match self {
            HaltReason::AllTasksDone => "ALL_TASKS_DONE",
            HaltReason::UserStopped => "USER_STOPPED",
            HaltReason::TokenLimit => "TOKEN_LIMIT",
            HaltReason::RuntimeLimit => "RUNTIME_LIMIT",
            HaltReason::ContextOverflow => "CONTEXT_OVERFLOW",
            HaltReason::HighErrorRate => "HIGH_ERROR_RATE",
            HaltReason::Stagnation => "STAGNATION",
            HaltReason::DiminishingReturns => "DIMINISHING_RETURNS",
            HaltReason::CriticalError => "CRITICAL_ERROR",
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One improvement-phase measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImprovementSample {
    /// Cycles completed so far.
    pub cycle: u32,
    /// Relative size of the last cycle's change, in [0, 1].
    pub magnitude: f64,
}

/// Health of the run at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the sample was taken.
    pub taken_at: DateTime<Utc>,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Token budget.
    pub token_limit: u64,
    /// Current context size.
    pub context_size: u64,
    /// Context window size.
    pub context_limit: u64,
    /// Failed or rejected tasks.
    pub errors: u64,
    /// Tasks in the run.
    pub total_tasks: u64,
    /// Minutes since the last task completed.
    pub minutes_since_progress: f64,
    /// Seconds since the run started.
    pub elapsed_secs: u64,
    /// Set while the improvement phase runs.
    pub improvement: Option<ImprovementSample>,
}

impl HealthSnapshot {
    /// A zeroed sample with the given limits.
    pub fn new(token_limit: u64, context_limit: u64) -> Self {
        Self {
            taken_at: Utc::now(),
            tokens_used: 0,
            token_limit,
            context_size: 0,
            context_limit,
            errors: 0,
            total_tasks: 0,
            minutes_since_progress: 0.0,
            elapsed_secs: 0,
            improvement: None,
        }
    }

    /// Tokens used over the limit; 0 without a limit.
    pub fn token_ratio(&self) -> f64 {
        ratio(self.tokens_used, self.token_limit)
    }

    /// Context size over the window; 0 without a window.
    pub fn context_ratio(&self) -> f64 {
        ratio(self.context_size, self.context_limit)
    }

    /// Errors over total tasks; 0 without tasks.
    pub fn error_ratio(&self) -> f64 {
        ratio(self.errors, self.total_tasks)
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Thresholds of the stopping rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopThresholds {
    /// Token budget.
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,
    /// Context window size.
    #[serde(default = "default_context_limit")]
    pub context_limit: u64,
    /// Wall-clock budget in seconds.
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    /// Token ratio that halts.
    #[serde(default = "default_token_ratio")]
    pub token_ratio: f64,
    /// Context ratio that triggers recovery.
    #[serde(default = "default_context_ratio")]
    pub context_ratio: f64,
    /// Error ratio that halts.
    #[serde(default = "default_error_ratio")]
    pub error_ratio: f64,
    /// Minutes without progress that halt.
    #[serde(default = "default_stagnation_minutes")]
    pub stagnation_minutes: f64,
    /// Improvement magnitude below which cycles stop.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
    /// Improvement cycles after which the phase stops.
    #[serde(default = "default_max_improvement_cycles")]
    pub max_improvement_cycles: u32,
}

fn default_token_limit() -> u64 {
    1_000_000
}
fn default_context_limit() -> u64 {
    200_000
}
fn default_max_runtime_secs() -> u64 {
    4 * 60 * 60
}
fn default_token_ratio() -> f64 {
    1.0
}
fn default_context_ratio() -> f64 {
    0.95
}
fn default_error_ratio() -> f64 {
    0.20
}
fn default_stagnation_minutes() -> f64 {
    30.0
}
fn default_min_improvement() -> f64 {
    0.10
}
fn default_max_improvement_cycles() -> u32 {
    5
}

impl Default for StopThresholds {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            context_limit: default_context_limit(),
            max_runtime_secs: default_max_runtime_secs(),
            token_ratio: default_token_ratio(),
            context_ratio: default_context_ratio(),
            error_ratio: default_error_ratio(),
            stagnation_minutes: default_stagnation_minutes(),
            min_improvement: default_min_improvement(),
            max_improvement_cycles: default_max_improvement_cycles(),
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// Keep going.
    Continue,
    /// Context was checkpointed and pruned; keep going.
    Recovered,
    /// Stop the run.
    Halt(HaltReason),
}

/// Frees context space when the window fills up.
#[async_trait]
pub trait ContextRecovery: Send + Sync {
    /// Persist progress and shrink the context. An error means the run
    /// cannot continue.
    async fn checkpoint_and_prune(&self) -> ForemanResult<()>;
}

/// Recovery that always fails.
pub struct NoRecovery;

#[async_trait]
impl ContextRecovery for NoRecovery {
    async fn checkpoint_and_prune(&self) -> ForemanResult<()> {
        Err(ForemanError::ResourceExhausted(
            "no context recovery configured".into(),
        ))
    }
}

/// Source of health samples.
pub trait MetricsFeed: Send + Sync {
    /// Take a sample now.
    fn sample(&self) -> HealthSnapshot;
}

/// Applies the stopping rules and keeps the sample history.
pub struct StoppingEvaluator {
    thresholds: StopThresholds,
    recovery: Arc<dyn ContextRecovery>,
    history: Mutex<Vec<HealthSnapshot>>,
    user_stop: AtomicBool,
    stop_requested: Notify,
}

impl StoppingEvaluator {
    /// Create an evaluator.
    pub fn new(thresholds: StopThresholds, recovery: Arc<dyn ContextRecovery>) -> Self {
        Self {
            thresholds,
            recovery,
            history: Mutex::new(Vec::new()),
            user_stop: AtomicBool::new(false),
            stop_requested: Notify::new(),
        }
    }

    /// Thresholds in use.
    pub fn thresholds(&self) -> &StopThresholds {
        &self.thresholds
    }

    /// Ask the run to stop at the next evaluation.
    pub fn request_stop(&self) {
        if !self.user_stop.swap(true, Ordering::SeqCst) {
            info!("Stop requested by operator");
        }
        self.stop_requested.notify_one();
    }

    /// Whether the operator asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.user_stop.load(Ordering::SeqCst)
    }

    /// Every sample evaluated so far.
    pub fn history(&self) -> Vec<HealthSnapshot> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply the rules to `snapshot`, first match wins.
    pub async fn evaluate(&self, snapshot: &HealthSnapshot) -> StopDecision {
        match self.history.lock() {
            Ok(mut history) => history.push(snapshot.clone()),
            Err(poisoned) => poisoned.into_inner().push(snapshot.clone()),
        }
        let t = &self.thresholds;

        if self.stop_requested() {
            return StopDecision::Halt(HaltReason::UserStopped);
        }
        if snapshot.token_limit > 0 && snapshot.token_ratio() >= t.token_ratio {
            return StopDecision::Halt(HaltReason::TokenLimit);
        }
        if snapshot.elapsed_secs >= t.max_runtime_secs {
            return StopDecision::Halt(HaltReason::RuntimeLimit);
        }
        if snapshot.context_limit > 0 && snapshot.context_ratio() >= t.context_ratio {
            return match self.recovery.checkpoint_and_prune().await {
                Ok(()) => {
                    info!(
                        context = snapshot.context_size,
                        limit = snapshot.context_limit,
                        "Context checkpointed and pruned"
                    );
                    StopDecision::Recovered
                }
                Err(e) => {
                    warn!(error = %e, "Context recovery failed");
                    StopDecision::Halt(HaltReason::ContextOverflow)
                }
            };
        }
        if snapshot.total_tasks > 0 && snapshot.error_ratio() >= t.error_ratio {
            return StopDecision::Halt(HaltReason::HighErrorRate);
        }
        if snapshot.minutes_since_progress >= t.stagnation_minutes {
            return StopDecision::Halt(HaltReason::Stagnation);
        }
        if let Some(improvement) = snapshot.improvement {
            let small = improvement.cycle >= 1 && improvement.magnitude < t.min_improvement;
            if small || improvement.cycle >= t.max_improvement_cycles {
                return StopDecision::Halt(HaltReason::DiminishingReturns);
            }
        }
        StopDecision::Continue
    }

    /// Human-readable detail for a halt.
    pub fn describe(&self, reason: HaltReason, snapshot: &HealthSnapshot) -> String {
        match reason {
            HaltReason::TokenLimit => format!(
                "{} of {} tokens used",
                snapshot.tokens_used, snapshot.token_limit
            ),
            HaltReason::RuntimeLimit => format!(
                "ran {}s, limit {}s",
                snapshot.elapsed_secs, self.thresholds.max_runtime_secs
            ),
            HaltReason::ContextOverflow => format!(
                "context {} of {} and recovery failed",
                snapshot.context_size, snapshot.context_limit
            ),
            HaltReason::HighErrorRate => format!(
                "{} of {} tasks failed",
                snapshot.errors, snapshot.total_tasks
            ),
            HaltReason::Stagnation => format!(
                "no progress for {:.0} minutes",
                snapshot.minutes_since_progress
            ),
            HaltReason::DiminishingReturns => match snapshot.improvement {
                Some(i) => format!(
                    "improvement cycle {} changed {:.0}%",
                    i.cycle,
                    i.magnitude * 100.0
                ),
                None => "improvement phase ended".to_string(),
            },
            HaltReason::UserStopped => "stop requested by operator".to_string(),
            HaltReason::AllTasksDone => "all tasks reached a terminal status".to_string(),
            HaltReason::CriticalError => "critical error".to_string(),
        }
    }

    /// Sample `feed` every `interval` until a rule halts the run.
    ///
    /// The halt is published on `halt_tx` (with its detail) and the
    /// scheduler stops allocating. A user stop is evaluated immediately
    /// instead of waiting for the next tick.
    pub async fn run(
        self: Arc<Self>,
        feed: Arc<dyn MetricsFeed>,
        scheduler: Arc<Scheduler>,
        interval: Duration,
        halt_tx: watch::Sender<Option<(HaltReason, String)>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop_requested.notified() => {}
            }
            let snapshot = feed.sample();
            if let StopDecision::Halt(reason) = self.evaluate(&snapshot).await {
                let detail = self.describe(reason, &snapshot);
                warn!(reason = %reason, detail = %detail, "Stopping condition met");
                scheduler.halt();
                if halt_tx.send(Some((reason, detail))).is_err() {
                    debug!(reason = %reason, "Run loop gone, halt not delivered");
                }
                return;
            }
        }
    }
}
