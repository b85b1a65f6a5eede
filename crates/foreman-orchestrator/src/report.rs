use crate::scheduler::TaskCounts;
use crate::stopping::{HaltReason, HealthSnapshot};
use crate::task_graph::GraphSnapshot;
use crate::types::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final account of a run, produced for every halt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Why the run ended.
    pub halt_reason: HaltReason,
    /// Human-readable detail of the condition.
    pub detail: String,
    /// Last health sample taken before the run ended.
    pub last_snapshot: Option<HealthSnapshot>,
    /// Final state of every task.
    pub graph: GraphSnapshot,
    /// Most recently approved task.
    pub last_completed_task: Option<TaskId>,
    /// Tasks per status.
    pub counts: TaskCounts,
    /// What the operator should do next.
    pub next_steps: Vec<String>,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Process exit code.
    ///
    /// 0 when every task completed, including runs ended by the
    /// improvement phase (which only starts after full completion). A
    /// normal finish with failed or skipped tasks exits 1; halts use the
    /// code of their reason.
    pub fn exit_code(&self) -> i32 {
        match self.halt_reason {
            HaltReason::AllTasksDone if !self.counts.all_completed() => 1,
            reason => reason.exit_code(),
        }
    }

    /// Multi-line summary for terminals.
    pub fn summary(&self) -> String {
        let c = &self.counts;
        let mut out = format!(
            "Run {} finished: {} ({})\n  tasks: {} total, {} completed, {} failed, {} skipped, {} not started\n",
            self.run_id,
            self.halt_reason,
            self.detail,
            c.total,
            c.completed,
            c.failed,
            c.skipped,
            c.pending + c.ready,
        );
        if let Some(last) = &self.last_completed_task {
            out.push_str(&format!("  last completed: {last}\n"));
        }
        let elapsed = self.finished_at - self.started_at;
        out.push_str(&format!("  elapsed: {}s\n", elapsed.num_seconds()));
        if !self.next_steps.is_empty() {
            out.push_str("Next steps:\n");
            for step in &self.next_steps {
                out.push_str(&format!("  - {step}\n"));
            }
        }
        out
    }
}

/// Actionable advice for a finished run.
pub fn next_steps(reason: HaltReason, detail: &str, graph: &GraphSnapshot) -> Vec<String> {
    let mut steps = Vec::new();
    match reason {
        HaltReason::AllTasksDone | HaltReason::DiminishingReturns => {
            steps.push("Review and merge the open pull requests.".to_string());
        }
        HaltReason::UserStopped => {
            steps.push("The run was stopped by the operator; start a new run for the remaining tasks.".to_string());
        }
        HaltReason::TokenLimit => {
            steps.push("Raise limits.token_limit or split the remaining work into a new run.".to_string());
        }
        HaltReason::RuntimeLimit => {
            steps.push("Raise limits.max_runtime_secs or run the remaining tasks separately.".to_string());
        }
        HaltReason::ContextOverflow => {
            steps.push("Run with a data directory so context can be checkpointed, or break tasks into smaller pieces.".to_string());
        }
        HaltReason::HighErrorRate => {
            steps.push("Inspect the failed tasks below and the backend configuration before re-running.".to_string());
        }
        HaltReason::Stagnation => {
            steps.push("No task completed recently; check backend health and the review threshold.".to_string());
        }
        HaltReason::CriticalError => {
            steps.push(format!("Resolve the critical error before resuming: {detail}"));
        }
    }

    for task in &graph.tasks {
        match &task.status {
            TaskStatus::Failed { reason } => {
                steps.push(format!("Task {} failed: {reason}", task.id));
            }
            TaskStatus::Skipped { reason } => {
                steps.push(format!("Task {} was skipped: {reason}", task.id));
            }
            _ => {}
        }
    }

    let remaining: Vec<&str> = graph
        .tasks
        .iter()
        .filter(|t| !t.is_terminal())
        .map(|t| t.id.as_str())
        .collect();
    if !remaining.is_empty() {
        steps.push(format!("Not finished: {}", remaining.join(", ")));
    }
    steps
}
