use crate::priority::{rank_ready, PriorityWeights};
use crate::task_graph::{GraphSnapshot, TaskGraph};
use crate::types::{Task, TaskArtifacts, TaskId, TaskStatus};
use foreman_core::ForemanResult;
use foreman_session::{EventLog, RunEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, info, warn};

/// How many tasks may hold a slot at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One slot; the first failure stops all further allocation.
    Sequential,
    /// Several slots; a failure only strands its own dependents.
    Parallel,
}

impl ExecutionMode {
    /// Mode implied by a slot budget.
    pub fn for_slots(slots: usize) -> Self {
        if slots <= 1 {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel
        }
    }
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// All tasks.
    pub total: usize,
    /// Waiting on dependencies.
    pub pending: usize,
    /// Waiting for a slot.
    pub ready: usize,
    /// Backend or rework in progress.
    pub running: usize,
    /// Waiting for a verdict.
    pub awaiting_review: usize,
    /// Approved.
    pub completed: usize,
    /// Rejected or errored.
    pub failed: usize,
    /// Abandoned.
    pub skipped: usize,
}

impl TaskCounts {
    /// Tally the statuses of a graph.
    pub fn of(graph: &TaskGraph) -> Self {
        let mut counts = TaskCounts {
            total: graph.len(),
            ..Default::default()
        };
        for task in graph.all_tasks() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::AwaitingReview => counts.awaiting_review += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Skipped { .. } => counts.skipped += 1,
            }
        }
        counts
    }

    /// Whether every task completed.
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerProgress {
    /// Tasks per status.
    pub counts: TaskCounts,
    /// Pending tasks blocked forever by a failed or skipped ancestor.
    pub stranded: usize,
    /// Nothing holds a slot and nothing more can be allocated.
    pub drained: bool,
    /// Allocation was halted.
    pub halted: bool,
}

/// Allocates ready tasks to execution slots by priority.
///
/// The scheduler is the only writer of task status. Slots are held from
/// `Running` through `AwaitingReview` and released when a task reaches a
/// terminal status.
pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    slots: usize,
    mode: ExecutionMode,
    weights: PriorityWeights,
    halt_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    slot_released: Notify,
    events: Option<EventLog>,
}

impl Scheduler {
    /// Create a scheduler with `slots` execution slots (at least one).
    pub fn new(slots: usize, weights: PriorityWeights) -> Self {
        let slots = slots.max(1);
        let (halt_tx, _) = watch::channel(false);
        Self {
            graph: Arc::new(RwLock::new(TaskGraph::new())),
            slots,
            mode: ExecutionMode::for_slots(slots),
            weights,
            halt_tx,
            stopped: AtomicBool::new(false),
            slot_released: Notify::new(),
            events: None,
        }
    }

    /// Log every status change to `events`.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Execution mode derived from the slot budget.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Slot budget.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Add a task to the graph.
    pub async fn enqueue(&self, task: Task) -> ForemanResult<TaskId> {
        let id = self.graph.write().await.enqueue(task)?;
        debug!(task_id = %id, "Task enqueued");
        Ok(id)
    }

    /// Allocate up to `min(max, free slots)` ready tasks, highest priority
    /// first, and mark them running.
    ///
    /// Ready tasks passed over in a round that allocated something age by
    /// one round.
    pub async fn next_ready(&self, max: usize) -> Vec<Task> {
        if self.is_halted() || self.stopped.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let mut graph = self.graph.write().await;
        let occupied = graph.count(TaskStatus::holds_slot);
        let take = max.min(self.slots.saturating_sub(occupied));
        if take == 0 {
            return Vec::new();
        }

        let ranked = rank_ready(&mut graph, &self.weights);
        let (chosen, passed_over) = ranked.split_at(take.min(ranked.len()));

        let mut allocated = Vec::with_capacity(chosen.len());
        for task in chosen {
            if let Err(e) = graph.mark_running(&task.id) {
                warn!(task_id = %task.id, error = %e, "Could not allocate task");
                continue;
            }
            self.log_transition(&task.id, "ready", "running");
            info!(task_id = %task.id, priority = task.priority, "Task allocated");
            if let Ok(task) = graph.get(&task.id) {
                allocated.push(task.clone());
            }
        }
        if !allocated.is_empty() {
            for task in passed_over {
                if let Err(e) = graph.bump_waited(&task.id) {
                    debug!(task_id = %task.id, error = %e, "Could not age passed-over task");
                }
            }
        }
        allocated
    }

    /// Running → AwaitingReview.
    pub async fn mark_submitted(&self, id: &TaskId) -> ForemanResult<()> {
        self.apply(id, |g| g.mark_awaiting_review(id)).await
    }

    /// AwaitingReview → Running for another round.
    pub async fn mark_rework(&self, id: &TaskId) -> ForemanResult<()> {
        self.apply(id, |g| g.mark_rework(id)).await
    }

    /// Complete a task, release its slot and return the dependents it
    /// promoted to Ready.
    pub async fn mark_completed(&self, id: &TaskId) -> ForemanResult<Vec<TaskId>> {
        let promoted = self.apply(id, |g| g.mark_completed(id)).await?;
        for dependent in &promoted {
            self.log_transition(dependent, "pending", "ready");
        }
        info!(task_id = %id, unblocked = promoted.len(), "Task completed");
        self.slot_released.notify_one();
        Ok(promoted)
    }

    /// Fail a task and release its slot.
    ///
    /// In sequential mode no further task is allocated afterwards.
    pub async fn mark_failed(&self, id: &TaskId, reason: impl Into<String>) -> ForemanResult<()> {
        let reason = reason.into();
        self.apply(id, |g| g.mark_failed(id, reason.clone())).await?;
        warn!(task_id = %id, reason = %reason, "Task failed");
        if self.mode == ExecutionMode::Sequential {
            self.stopped.store(true, Ordering::SeqCst);
            info!(task_id = %id, "Sequential mode: allocation stopped after failure");
        }
        self.slot_released.notify_one();
        Ok(())
    }

    /// Skip a task and release its slot.
    pub async fn mark_skipped(&self, id: &TaskId, reason: impl Into<String>) -> ForemanResult<()> {
        let reason = reason.into();
        self.apply(id, |g| g.mark_skipped(id, reason.clone())).await?;
        info!(task_id = %id, reason = %reason, "Task skipped");
        self.slot_released.notify_one();
        Ok(())
    }

    /// Store the review iteration count on the task.
    pub async fn record_review_iteration(&self, id: &TaskId, iterations: u32) -> ForemanResult<()> {
        self.graph
            .write()
            .await
            .record_review_iteration(id, iterations)
    }

    /// Replace the artifacts of a task.
    pub async fn update_artifacts(&self, id: &TaskId, artifacts: TaskArtifacts) -> ForemanResult<()> {
        self.graph.write().await.update_artifacts(id, artifacts)
    }

    /// Operator retry: Failed → Ready (or Pending). Re-enables allocation in
    /// sequential mode. Never called by the engine.
    pub async fn retry_failed(&self, id: &TaskId) -> ForemanResult<()> {
        self.apply(id, |g| g.reset_failed(id)).await?;
        self.stopped.store(false, Ordering::SeqCst);
        info!(task_id = %id, "Failed task reset by operator");
        Ok(())
    }

    /// Stop all further allocation.
    pub fn halt(&self) {
        if !self.halt_tx.send_replace(true) {
            info!("Scheduler halted");
        }
        self.slot_released.notify_waiters();
    }

    /// Whether allocation was halted.
    pub fn is_halted(&self) -> bool {
        *self.halt_tx.borrow()
    }

    /// Receiver that flips to `true` on halt.
    pub fn halt_receiver(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    /// Wait until a slot is released.
    pub async fn wait_for_slot(&self) {
        self.slot_released.notified().await;
    }

    /// Number of currently free slots.
    pub async fn free_slots(&self) -> usize {
        let occupied = self.graph.read().await.count(TaskStatus::holds_slot);
        self.slots.saturating_sub(occupied)
    }

    /// Counts and drain state.
    pub async fn progress(&self) -> SchedulerProgress {
        let graph = self.graph.read().await;
        let counts = TaskCounts::of(&graph);
        let stranded = graph
            .all_tasks()
            .iter()
            .filter(|t| graph.is_stranded(&t.id))
            .count();
        let halted = self.is_halted();
        let allocatable = counts.ready > 0 && !halted && !self.stopped.load(Ordering::SeqCst);
        let holding = counts.running + counts.awaiting_review;
        SchedulerProgress {
            counts,
            stranded,
            drained: holding == 0 && !allocatable,
            halted,
        }
    }

    /// Copy of one task.
    pub async fn task(&self, id: &TaskId) -> ForemanResult<Task> {
        self.graph.read().await.get(id).cloned()
    }

    /// Snapshot of the whole graph.
    pub async fn snapshot(&self) -> GraphSnapshot {
        self.graph.read().await.snapshot()
    }

    /// Check the graph invariants.
    pub async fn check_invariants(&self) -> ForemanResult<()> {
        self.graph.read().await.check_invariants()
    }

    async fn apply<T>(
        &self,
        id: &TaskId,
        op: impl FnOnce(&mut TaskGraph) -> ForemanResult<T>,
    ) -> ForemanResult<T> {
        let mut graph = self.graph.write().await;
        let from = graph.get(id)?.status.label();
        let out = op(&mut graph)?;
        let to = graph.get(id)?.status.label();
        drop(graph);
        self.log_transition(id, from, to);
        Ok(out)
    }

    fn log_transition(&self, id: &TaskId, from: &str, to: &str) {
        debug!(task_id = %id, from, to, "Task transition");
        if let Some(events) = &self.events {
            events.log(RunEvent::TaskTransition {
                task_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    async fn finish(scheduler: &Scheduler, task: &str) {
        scheduler.mark_submitted(&id(task)).await.unwrap();
        scheduler.mark_completed(&id(task)).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_dependency_is_never_allocated_first() {
        let scheduler = Scheduler::new(1, PriorityWeights::default());
        scheduler
            .enqueue(Task::new("T1", "Base").with_priority(30.0))
            .await
            .unwrap();
        scheduler
            .enqueue(
                Task::new("T2", "Follow-up")
                    .with_priority(90.0)
                    .with_dependencies(["T1"]),
            )
            .await
            .unwrap();

        let first = scheduler.next_ready(1).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id("T1"));
        assert_eq!(first[0].status, TaskStatus::Running);

        finish(&scheduler, "T1").await;
        let second = scheduler.next_ready(1).await;
        assert_eq!(second[0].id, id("T2"));
    }

    #[tokio::test]
    async fn test_allocation_respects_free_slots() {
        let scheduler = Scheduler::new(2, PriorityWeights::default());
        for name in ["A", "B", "C"] {
            scheduler.enqueue(Task::new(name, name)).await.unwrap();
        }
        assert_eq!(scheduler.mode(), ExecutionMode::Parallel);
        assert_eq!(scheduler.next_ready(10).await.len(), 2);
        assert!(scheduler.next_ready(10).await.is_empty());
        assert_eq!(scheduler.free_slots().await, 0);

        // A task under review still holds its slot.
        scheduler.mark_submitted(&id("A")).await.unwrap();
        assert!(scheduler.next_ready(10).await.is_empty());

        scheduler.mark_completed(&id("A")).await.unwrap();
        let next = scheduler.next_ready(10).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, id("C"));
    }

    #[tokio::test]
    async fn test_passed_over_tasks_age() {
        let scheduler = Scheduler::new(1, PriorityWeights::default());
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        scheduler.enqueue(Task::new("B", "b")).await.unwrap();
        scheduler.next_ready(1).await;
        assert_eq!(scheduler.task(&id("B")).await.unwrap().waited_rounds, 1);

        // Nothing allocated, nothing ages.
        scheduler.next_ready(1).await;
        assert_eq!(scheduler.task(&id("B")).await.unwrap().waited_rounds, 1);
    }

    #[tokio::test]
    async fn test_sequential_failure_stops_allocation() {
        let scheduler = Scheduler::new(1, PriorityWeights::default());
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        scheduler.enqueue(Task::new("B", "b")).await.unwrap();
        scheduler.next_ready(1).await;
        scheduler.mark_failed(&id("A"), "backend error").await.unwrap();

        assert!(scheduler.next_ready(1).await.is_empty());
        let progress = scheduler.progress().await;
        assert!(progress.drained);
        assert_eq!(progress.counts.ready, 1);

        scheduler.retry_failed(&id("A")).await.unwrap();
        assert_eq!(scheduler.next_ready(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_failure_only_strands_dependents() {
        let scheduler = Scheduler::new(2, PriorityWeights::default());
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        scheduler.enqueue(Task::new("B", "b")).await.unwrap();
        scheduler
            .enqueue(Task::new("C", "c").with_dependencies(["A"]))
            .await
            .unwrap();
        scheduler.next_ready(2).await;
        scheduler.mark_failed(&id("A"), "rejected").await.unwrap();
        finish(&scheduler, "B").await;

        let progress = scheduler.progress().await;
        assert!(progress.drained);
        assert_eq!(progress.stranded, 1);
        assert_eq!(progress.counts.completed, 1);
        assert_eq!(progress.counts.failed, 1);
    }

    #[tokio::test]
    async fn test_halt_blocks_allocation() {
        let scheduler = Scheduler::new(1, PriorityWeights::default());
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        let mut rx = scheduler.halt_receiver();
        scheduler.halt();
        assert!(scheduler.is_halted());
        assert!(scheduler.next_ready(1).await.is_empty());
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(scheduler.progress().await.drained);
    }

    #[tokio::test]
    async fn test_slot_release_wakes_waiter() {
        let scheduler = Arc::new(Scheduler::new(1, PriorityWeights::default()));
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        scheduler.next_ready(1).await;

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.wait_for_slot().await })
        };
        scheduler.mark_skipped(&id("A"), "operator").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_transitions_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), "run-1").await.unwrap();
        let scheduler = Scheduler::new(1, PriorityWeights::default()).with_events(log.clone());
        scheduler.enqueue(Task::new("A", "a")).await.unwrap();
        scheduler
            .enqueue(Task::new("B", "b").with_dependencies(["A"]))
            .await
            .unwrap();
        scheduler.next_ready(1).await;
        finish(&scheduler, "A").await;
        log.flush().await.unwrap();

        let events = foreman_session::read_events(log.path()).await.unwrap();
        let transitions: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::TaskTransition { task_id, to, .. } => {
                    Some(format!("{task_id}:{to}"))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec!["A:running", "A:awaiting_review", "A:completed", "B:ready"]
        );
    }
}
