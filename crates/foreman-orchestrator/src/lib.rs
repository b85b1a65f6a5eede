//! Task orchestration for Foreman: dependency-aware scheduling, a scored
//! review loop, and stopping conditions that end a run with a report.
//!
//! A run turns a requirements outline (or an explicit plan) into tasks,
//! allocates ready tasks to execution slots by priority, drives each one
//! through backend generation, version control and review rounds, and
//! halts on completion or when a health rule fires.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Runs a task list to completion or halt.
//! - [`TaskGraph`] — Tasks, dependencies and the status lifecycle.
//! - [`Scheduler`] — Allocates ready tasks to slots by priority.
//! - [`ReviewCycle`] — Scores submissions and applies verdicts.
//! - [`StoppingEvaluator`] — Applies the halt rules to health samples.
//! - [`RunReport`] — How a run ended and what to do next.

/// Run configuration (`foreman.toml`).
pub mod config;
/// Per-run shared context.
pub mod context;
/// Run loop and context recovery.
pub mod engine;
/// Per-task execution job.
pub mod executor;
/// Run-wide counters.
pub mod monitor;
/// Requirements and plan-file parsing.
pub mod planner;
/// Priority weights and ranking.
pub mod priority;
/// Final run report.
pub mod report;
/// Scoring and the review state machine.
pub mod review;
/// Slot allocation over the task graph.
pub mod scheduler;
/// Stopping rules.
pub mod stopping;
/// Dependency graph of tasks.
pub mod task_graph;
/// Task model.
pub mod types;

pub use config::ForemanConfig;
pub use context::RunContext;
pub use engine::{CheckpointRecovery, Orchestrator};
pub use executor::{TaskExecutor, TaskOutcome, COORDINATOR_AGENT};
pub use monitor::RunMetrics;
pub use planner::{order_tasks, OutlinePlanner, PlanFile, Planner};
pub use priority::{compute_priority, rank_ready, PriorityWeights};
pub use report::RunReport;
pub use review::{
    BaselineReviewer, BlockingIssue, BlockingIssueKind, ReviewConfig, ReviewCycle,
    ReviewOutcome, ReviewResult, ReviewVerdict, Reviewer, Submission, REVIEWER_AGENT,
};
pub use scheduler::{ExecutionMode, Scheduler, TaskCounts};
pub use stopping::{HaltReason, HealthSnapshot, StopDecision, StopThresholds, StoppingEvaluator};
pub use task_graph::{GraphSnapshot, TaskGraph};
pub use types::{Task, TaskArtifacts, TaskCategory, TaskId, TaskStatus};
