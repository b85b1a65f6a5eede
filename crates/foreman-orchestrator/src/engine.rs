use crate::context::RunContext;
use crate::executor::{TaskExecutor, TaskOutcome};
use crate::report::{next_steps, RunReport};
use crate::review::{ReviewCycle, Reviewer};
use crate::scheduler::Scheduler;
use crate::stopping::{
    ContextRecovery, HaltReason, MetricsFeed, StopDecision, StoppingEvaluator,
};
use crate::types::{Task, TaskCategory, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use foreman_agent::{Backend, VersionControl};
use foreman_core::intervention::InterventionChannel;
use foreman_core::{ForemanError, ForemanResult};
use foreman_session::RunEvent;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Saves the graph to the run store and prunes the context counter.
pub struct CheckpointRecovery {
    ctx: RunContext,
    scheduler: Arc<Scheduler>,
}

impl CheckpointRecovery {
    /// Recovery writing into `ctx.store`.
    pub fn new(ctx: RunContext, scheduler: Arc<Scheduler>) -> Self {
        Self { ctx, scheduler }
    }
}

#[async_trait]
impl ContextRecovery for CheckpointRecovery {
    async fn checkpoint_and_prune(&self) -> ForemanResult<()> {
        let store = self.ctx.store.as_ref().ok_or_else(|| {
            ForemanError::ResourceExhausted(
                "context window full and no run store to checkpoint into".into(),
            )
        })?;
        let snapshot = self.scheduler.snapshot().await;
        store.save_snapshot(&self.ctx.run_id, &snapshot).await?;
        self.ctx.metrics.reset_context(0);
        info!(run_id = %self.ctx.run_id, tasks = snapshot.tasks.len(), "Context checkpointed and pruned");
        Ok(())
    }
}

/// Runs a task list to completion or halt.
///
/// One orchestrator drives one run: it owns the scheduler, the review
/// cycle, and the stopping evaluator, and spawns an executor job per
/// allocated task.
pub struct Orchestrator {
    ctx: RunContext,
    scheduler: Arc<Scheduler>,
    review: Arc<ReviewCycle>,
    evaluator: Arc<StoppingEvaluator>,
    executor: Arc<TaskExecutor>,
}

impl Orchestrator {
    /// Wire the run's collaborators. Fails on invalid configuration.
    pub fn new(
        ctx: RunContext,
        backend: Arc<dyn Backend>,
        vcs: Arc<dyn VersionControl>,
        reviewer: Arc<dyn Reviewer>,
        intervention: Arc<dyn InterventionChannel>,
    ) -> ForemanResult<Self> {
        let config = Arc::clone(&ctx.config);
        config.validate()?;

        let mut scheduler = Scheduler::new(config.orchestrator.slots, config.priority.clone());
        if let Some(events) = &ctx.events {
            scheduler = scheduler.with_events(events.clone());
        }
        let scheduler = Arc::new(scheduler);
        let review = Arc::new(ReviewCycle::new(
            Arc::clone(&scheduler),
            reviewer,
            config.review.clone(),
        )?);
        let recovery = Arc::new(CheckpointRecovery::new(ctx.clone(), Arc::clone(&scheduler)));
        let evaluator = Arc::new(StoppingEvaluator::new(config.limits.clone(), recovery));
        let executor = Arc::new(TaskExecutor::new(
            ctx.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&review),
            backend,
            vcs,
            intervention,
        ));

        Ok(Self {
            ctx,
            scheduler,
            review,
            evaluator,
            executor,
        })
    }

    /// Run identifier.
    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    /// The scheduler, for inspection.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// The stopping evaluator; call `request_stop` on it to stop the run.
    pub fn evaluator(&self) -> Arc<StoppingEvaluator> {
        Arc::clone(&self.evaluator)
    }

    /// The review cycle.
    pub fn review(&self) -> Arc<ReviewCycle> {
        Arc::clone(&self.review)
    }

    /// Execute `tasks` and report how the run ended.
    ///
    /// Errors are returned only for invalid input (duplicate ids, unknown
    /// dependencies); every other ending produces a [`RunReport`].
    pub async fn run(&self, tasks: Vec<Task>) -> ForemanResult<RunReport> {
        let started_at = Utc::now();
        let total = tasks.len();
        for task in tasks {
            self.scheduler.enqueue(task).await?;
        }
        self.ctx.metrics.set_total_tasks(total as u64);
        self.ctx.log(RunEvent::RunStarted { tasks: total });
        info!(
            run_id = %self.ctx.run_id,
            tasks = total,
            slots = self.scheduler.slots(),
            mode = ?self.scheduler.mode(),
            "Run started"
        );

        if total == 0 {
            return self
                .finish(
                    started_at,
                    HaltReason::AllTasksDone,
                    "no tasks to run".into(),
                    None,
                )
                .await;
        }

        let subscription = self.review.attach(&self.ctx.bus);
        let (halt_tx, mut halt_rx) = watch::channel(None);
        let feed: Arc<dyn MetricsFeed> = self.ctx.metrics.clone();
        let evaluator_task = tokio::spawn(Arc::clone(&self.evaluator).run(
            feed,
            Arc::clone(&self.scheduler),
            Duration::from_millis(self.ctx.config.orchestrator.sample_interval_ms),
            halt_tx,
        ));

        let mut jobs: JoinSet<(TaskId, TaskOutcome)> = JoinSet::new();
        let mut critical: Option<String> = None;
        let mut operator_halt = false;
        let mut evaluator_live = true;
        let mut last_completed: Option<TaskId> = None;
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.ctx.config.orchestrator.tick_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !self.scheduler.is_halted() {
                let free = self.scheduler.free_slots().await;
                if free > 0 {
                    for task in self.scheduler.next_ready(free).await {
                        let executor = Arc::clone(&self.executor);
                        jobs.spawn(async move {
                            let id = task.id.clone();
                            let outcome = executor.run(task).await;
                            (id, outcome)
                        });
                    }
                }
            }

            if jobs.is_empty() {
                let progress = self.scheduler.progress().await;
                if progress.drained || progress.halted {
                    break;
                }
            }

            tokio::select! {
                joined = jobs.join_next(), if !jobs.is_empty() => match joined {
                    Some(Ok((id, outcome))) => match outcome {
                        TaskOutcome::Completed => last_completed = Some(id),
                        TaskOutcome::Critical(message) => {
                            error!(task_id = %id, error = %message, "Critical error, halting run");
                            critical.get_or_insert(message);
                            self.scheduler.halt();
                            self.checkpoint().await;
                        }
                        TaskOutcome::HaltRequested => {
                            warn!(task_id = %id, "Operator halted the run");
                            operator_halt = true;
                            self.scheduler.halt();
                        }
                        _ => {}
                    },
                    Some(Err(e)) => {
                        error!(error = %e, "Task job panicked");
                        critical.get_or_insert(format!("task job failed: {e}"));
                        self.scheduler.halt();
                    }
                    None => {}
                },
                changed = halt_rx.changed(), if evaluator_live => {
                    if changed.is_err() {
                        evaluator_live = false;
                    }
                }
                _ = self.scheduler.wait_for_slot() => {}
                _ = ticker.tick() => {}
            }
        }

        let evaluator_halt = halt_rx.borrow().clone();

        let progress = self.scheduler.progress().await;
        let ending = if let Some(message) = critical {
            (HaltReason::CriticalError, message)
        } else if let Some((reason, detail)) = evaluator_halt {
            (reason, detail)
        } else if operator_halt {
            (
                HaltReason::UserStopped,
                "halted by operator during an intervention".to_string(),
            )
        } else if progress.counts.all_completed() && self.ctx.config.improvement.enabled {
            match self.improve(&mut halt_rx).await {
                Ok(ending) => ending,
                Err(e) => {
                    self.ctx.bus.unsubscribe(subscription);
                    evaluator_task.abort();
                    return Err(e);
                }
            }
        } else {
            let c = progress.counts;
            (
                HaltReason::AllTasksDone,
                format!(
                    "{} of {} tasks completed, {} failed, {} skipped",
                    c.completed, c.total, c.failed, c.skipped
                ),
            )
        };
        self.ctx.bus.unsubscribe(subscription);
        evaluator_task.abort();
        let (reason, detail) = ending;

        let last_completed = match last_completed {
            Some(id) => Some(id),
            None => self.last_completed_in_graph().await,
        };
        self.finish(started_at, reason, detail, last_completed).await
    }

    /// Improvement cycles after full completion, each run as a refactor
    /// task through the normal executor and review path. The magnitude of a
    /// cycle is the share of its files that no earlier task produced.
    ///
    /// The stopping evaluator keeps sampling: a halt it publishes ends the
    /// cycle in flight and the phase.
    async fn improve(&self, halt_rx: &mut HaltReceiver) -> ForemanResult<(HaltReason, String)> {
        let mut cycle = 0u32;
        loop {
            if let Some(halt) = halt_rx.borrow().clone() {
                return Ok(halt);
            }
            cycle += 1;
            let graph = self.scheduler.snapshot().await;
            let known: HashSet<String> = graph
                .tasks
                .iter()
                .flat_map(|t| t.artifacts.files.iter().cloned())
                .collect();
            let completed: Vec<String> = graph
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| format!("- {}: {}", t.id, t.title))
                .collect();

            let task = Task::new(format!("improve-{cycle}"), format!("Improvement cycle {cycle}"))
                .with_category(TaskCategory::Refactor)
                .with_description(format!(
                    "Improve the quality, tests and documentation of the completed work:\n{}",
                    completed.join("\n")
                ))
                .with_criteria(["public items are documented", "tests cover the changed behaviour"]);
            let id = self.scheduler.enqueue(task).await?;
            self.ctx.metrics.set_total_tasks(graph.tasks.len() as u64 + 1);

            let Some(task) = self.scheduler.next_ready(1).await.into_iter().next() else {
                if self.scheduler.is_halted() {
                    return Ok(wait_for_halt(halt_rx).await);
                }
                return Ok((HaltReason::DiminishingReturns, "nothing left to improve".into()));
            };
            let outcome = tokio::select! {
                outcome = self.executor.run(task) => outcome,
                halt = wait_for_halt(halt_rx) => {
                    if let Err(e) = self.scheduler.mark_skipped(&id, "abandoned: run halted").await {
                        warn!(task_id = %id, error = %e, "Could not mark task skipped");
                    }
                    info!(cycle, reason = %halt.0, "Improvement cycle interrupted");
                    return Ok(halt);
                }
            };
            match outcome {
                TaskOutcome::Critical(message) => {
                    self.checkpoint().await;
                    return Ok((HaltReason::CriticalError, message));
                }
                TaskOutcome::HaltRequested => {
                    return Ok((
                        HaltReason::UserStopped,
                        "halted by operator during an intervention".into(),
                    ));
                }
                TaskOutcome::Abandoned => {
                    if let Some(halt) = halt_rx.borrow().clone() {
                        return Ok(halt);
                    }
                }
                _ => {}
            }

            let done = self.scheduler.task(&id).await?;
            let magnitude = if done.status == TaskStatus::Completed && !done.artifacts.files.is_empty() {
                let fresh = done.artifacts.files.iter().filter(|f| !known.contains(*f)).count();
                fresh as f64 / done.artifacts.files.len() as f64
            } else {
                0.0
            };
            self.ctx.metrics.record_improvement(cycle, magnitude);
            info!(cycle, magnitude, status = %done.status, "Improvement cycle finished");

            let sample = self.ctx.metrics.sample();
            if let StopDecision::Halt(reason) = self.evaluator.evaluate(&sample).await {
                return Ok((reason, self.evaluator.describe(reason, &sample)));
            }
        }
    }

    async fn last_completed_in_graph(&self) -> Option<TaskId> {
        self.scheduler
            .snapshot()
            .await
            .tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .max_by_key(|t| t.completed_at)
            .map(|t| t.id)
    }

    async fn checkpoint(&self) {
        let Some(store) = &self.ctx.store else {
            return;
        };
        let snapshot = self.scheduler.snapshot().await;
        if let Err(e) = store.save_snapshot(&self.ctx.run_id, &snapshot).await {
            error!(run_id = %self.ctx.run_id, error = %e, "Checkpoint failed");
        }
    }

    async fn finish(
        &self,
        started_at: chrono::DateTime<Utc>,
        reason: HaltReason,
        detail: String,
        last_completed_task: Option<TaskId>,
    ) -> ForemanResult<RunReport> {
        let graph = self.scheduler.snapshot().await;
        let counts = self.scheduler.progress().await.counts;
        let report = RunReport {
            run_id: self.ctx.run_id.clone(),
            halt_reason: reason,
            next_steps: next_steps(reason, &detail, &graph),
            detail,
            last_snapshot: Some(self.ctx.metrics.sample()),
            graph,
            last_completed_task,
            counts,
            started_at,
            finished_at: Utc::now(),
        };
        let exit_code = report.exit_code();

        if reason != HaltReason::AllTasksDone {
            self.ctx.log(RunEvent::Halt {
                reason: reason.to_string(),
                detail: report.detail.clone(),
            });
        }
        self.ctx.log(RunEvent::RunFinished {
            reason: reason.to_string(),
            exit_code,
        });

        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.save_snapshot(&self.ctx.run_id, &report.graph).await {
                error!(run_id = %self.ctx.run_id, error = %e, "Could not save final snapshot");
            }
            if let Err(e) = store.save_report(&self.ctx.run_id, &report).await {
                error!(run_id = %self.ctx.run_id, error = %e, "Could not save run report");
            }
        }
        if let Some(events) = &self.ctx.events {
            if let Err(e) = events.flush().await {
                warn!(run_id = %self.ctx.run_id, error = %e, "Could not flush event log");
            }
        }

        info!(
            run_id = %report.run_id,
            reason = %reason,
            exit_code,
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            "Run finished"
        );
        Ok(report)
    }
}

type HaltReceiver = watch::Receiver<Option<(HaltReason, String)>>;

/// Resolves with the evaluator's halt; pends forever once the evaluator is
/// gone without one.
async fn wait_for_halt(halt_rx: &mut HaltReceiver) -> (HaltReason, String) {
    if let Ok(halt) = halt_rx.wait_for(Option::is_some).await {
        if let Some(halt) = halt.clone() {
            return halt;
        }
    }
    std::future::pending().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ForemanConfig;
    use crate::review::{ReviewResult, Submission};
    use foreman_agent::backends::DryRunBackend;
    use foreman_agent::vcs::LocalVcs;
    use foreman_core::intervention::{FixedActionChannel, InterventionAction};

    struct Approve;

    #[async_trait]
    impl Reviewer for Approve {
        async fn review(&self, _submission: &Submission) -> ForemanResult<ReviewResult> {
            Ok(ReviewResult::new(92.0, vec![]))
        }
    }

    fn orchestrator(config: ForemanConfig, workspace: &std::path::Path) -> Orchestrator {
        let mut config = config;
        config.workspace_dir = workspace.to_path_buf();
        Orchestrator::new(
            RunContext::new(config),
            Arc::new(DryRunBackend::new()),
            Arc::new(LocalVcs::new()),
            Arc::new(Approve),
            Arc::new(FixedActionChannel::new(InterventionAction::Skip)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_run_finishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let report = orchestrator(ForemanConfig::default(), dir.path())
            .run(vec![])
            .await
            .unwrap();
        assert_eq!(report.halt_reason, HaltReason::AllTasksDone);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.counts.total, 0);
    }

    #[tokio::test]
    async fn test_dependent_tasks_complete_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(ForemanConfig::default(), dir.path());
        let report = orch
            .run(vec![
                Task::new("T1", "Scaffold project").with_category(TaskCategory::Setup),
                Task::new("T2", "Add parser").with_dependencies(["T1"]),
            ])
            .await
            .unwrap();
        assert_eq!(report.halt_reason, HaltReason::AllTasksDone);
        assert!(report.counts.all_completed());
        assert_eq!(report.last_completed_task, Some(TaskId::from("T2")));
        assert_eq!(report.exit_code(), 0);
        orch.scheduler().check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_improvement_phase_ends_with_diminishing_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ForemanConfig::default();
        config.improvement.enabled = true;
        config.limits.max_improvement_cycles = 2;
        let report = orchestrator(config, dir.path())
            .run(vec![Task::new("T1", "Add parser")])
            .await
            .unwrap();
        assert_eq!(report.halt_reason, HaltReason::DiminishingReturns);
        assert_eq!(report.exit_code(), 0);
        assert!(report
            .graph
            .tasks
            .iter()
            .any(|t| t.id.as_str() == "improve-1"));
    }

    #[tokio::test]
    async fn test_checkpoint_requires_store() {
        let ctx = RunContext::new(ForemanConfig::default());
        let scheduler = Arc::new(Scheduler::new(1, Default::default()));
        let recovery = CheckpointRecovery::new(ctx.clone(), scheduler);
        ctx.metrics.add_context(500);
        let err = recovery.checkpoint_and_prune().await.unwrap_err();
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_checkpoint_saves_snapshot_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ForemanConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let ctx = RunContext::persistent(config).await.unwrap();
        let scheduler = Arc::new(Scheduler::new(1, Default::default()));
        scheduler.enqueue(Task::new("T1", "One")).await.unwrap();
        ctx.metrics.add_context(500);

        CheckpointRecovery::new(ctx.clone(), scheduler)
            .checkpoint_and_prune()
            .await
            .unwrap();
        assert_eq!(ctx.metrics.sample().context_size, 0);
        let saved: Option<crate::task_graph::GraphSnapshot> = ctx
            .store
            .as_ref()
            .unwrap()
            .load_snapshot(&ctx.run_id)
            .await
            .unwrap();
        assert_eq!(saved.unwrap().tasks.len(), 1);
    }
}
