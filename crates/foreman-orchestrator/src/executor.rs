use crate::context::RunContext;
use crate::review::{
    ReviewCycle, ReviewOutcome, ReviewReply, ReviewVerdict, Submission, REVIEWER_AGENT,
};
use crate::scheduler::Scheduler;
use crate::types::{Task, TaskArtifacts};
use foreman_agent::{compute_backoff, Backend, ChangeRequest, ExecutionOutput, VersionControl};
use foreman_bus::{Message, MessageKind};
use foreman_core::intervention::{
    request_with_deadline, DecisionSource, InterventionAction, InterventionChannel,
    InterventionRequest, RiskLevel,
};
use foreman_core::{ErrorSeverity, ForemanError, ForemanResult};
use foreman_session::RunEvent;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bus identity of the engine.
pub const COORDINATOR_AGENT: &str = "coordinator";

/// How one task job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Approved by review.
    Completed,
    /// Review feedback rounds exhausted.
    Rejected,
    /// Failed without a review verdict (operator retries exhausted, or a
    /// scheduler refusal).
    Failed(String),
    /// Skipped after an error.
    Skipped,
    /// The run halted while the job was in flight.
    Abandoned,
    /// The operator chose to halt the run.
    HaltRequested,
    /// A critical error; the run must stop.
    Critical(String),
}

enum Resolution {
    Retry,
    Stop(TaskOutcome),
}

/// Retry budgets of one task.
#[derive(Debug, Default)]
struct Attempts {
    /// Automatic retries in the current run of transient failures.
    transient: u32,
    /// Retries granted by the operator.
    operator: u32,
}

/// Drives one task through generate, commit, and review rounds until the
/// review cycle settles it.
pub struct TaskExecutor {
    ctx: RunContext,
    scheduler: Arc<Scheduler>,
    review: Arc<ReviewCycle>,
    backend: Arc<dyn Backend>,
    vcs: Arc<dyn VersionControl>,
    intervention: Arc<dyn InterventionChannel>,
}

impl TaskExecutor {
    /// Create an executor sharing the run's collaborators.
    pub fn new(
        ctx: RunContext,
        scheduler: Arc<Scheduler>,
        review: Arc<ReviewCycle>,
        backend: Arc<dyn Backend>,
        vcs: Arc<dyn VersionControl>,
        intervention: Arc<dyn InterventionChannel>,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            review,
            backend,
            vcs,
            intervention,
        }
    }

    /// Run `task`, which the scheduler has already marked running.
    pub async fn run(&self, task: Task) -> TaskOutcome {
        let agent = executor_agent(&task);
        self.notify(
            MessageKind::Assignment,
            COORDINATOR_AGENT,
            &agent,
            json!({ "task_id": task.id, "title": task.title }),
        );
        info!(task_id = %task.id, title = %task.title, "Task started");

        let config = &self.ctx.config;
        let change = ChangeRequest::new(
            task.id.as_str(),
            task.title.clone(),
            task.prompt(),
            config.vcs.base_branch.clone(),
        );
        let review_timeout = Duration::from_secs(config.orchestrator.review_timeout_secs);
        let mut artifacts = task.artifacts.clone();
        let mut feedback: Vec<String> = Vec::new();
        let mut attempts = Attempts::default();
        let mut round = 1u32;

        loop {
            if self.scheduler.is_halted() {
                return self.abandon(&task).await;
            }

            let prompt = build_prompt(&task, &feedback);
            let output = match self.backend.execute(&prompt, &config.workspace_dir).await {
                Ok(output) => output,
                Err(e) => match self.resolve(&task, e, &mut attempts).await {
                    Resolution::Retry => continue,
                    Resolution::Stop(outcome) => return outcome,
                },
            };
            attempts.transient = 0;
            self.ctx.metrics.record_tokens(output.tokens_used);
            self.ctx.metrics.add_context(output.tokens_used);
            debug!(
                task_id = %task.id,
                round,
                files = output.files.len(),
                tokens = output.tokens_used,
                "Backend finished"
            );
            if self.scheduler.is_halted() {
                return self.abandon(&task).await;
            }

            loop {
                match self.publish(&change, &output, round, &mut artifacts).await {
                    Ok(()) => {
                        attempts.transient = 0;
                        break;
                    }
                    Err(e) => match self.resolve(&task, e, &mut attempts).await {
                        Resolution::Retry => continue,
                        Resolution::Stop(outcome) => return outcome,
                    },
                }
            }
            if let Err(e) = self.scheduler.update_artifacts(&task.id, artifacts.clone()).await {
                warn!(task_id = %task.id, error = %e, "Could not record artifacts");
            }
            if let Err(e) = self.scheduler.mark_submitted(&task.id).await {
                return self.refused(&task, e).await;
            }

            let submission = Submission {
                task_id: task.id.clone(),
                title: task.title.clone(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                files: output.files.clone(),
                lint_clean: None,
                tests_passed: None,
                iteration: round,
                pr_url: artifacts.pr_url.clone(),
                summary: output.summary.clone(),
            };

            let verdict = loop {
                match self.request_review(&agent, &submission, review_timeout).await {
                    Ok(verdict) => break verdict,
                    Err(e) => {
                        if let Some(verdict) = self.review.verdict(&task.id, round).await {
                            debug!(task_id = %task.id, round, error = %e, "Review settled after the request failed");
                            break verdict;
                        }
                        match self.resolve(&task, e, &mut attempts).await {
                            Resolution::Retry => continue,
                            Resolution::Stop(outcome) => return outcome,
                        }
                    }
                }
            };

            attempts.transient = 0;

            match verdict.outcome {
                ReviewOutcome::Approved => {
                    self.ctx.metrics.mark_progress();
                    self.notify(
                        MessageKind::Completion,
                        &agent,
                        COORDINATOR_AGENT,
                        json!({ "task_id": task.id, "score": verdict.result.score }),
                    );
                    info!(task_id = %task.id, score = verdict.result.score, rounds = round, "Task completed");
                    return TaskOutcome::Completed;
                }
                ReviewOutcome::FeedbackSent => {
                    feedback.push(verdict.result.feedback_text());
                    round += 1;
                    info!(task_id = %task.id, score = verdict.result.score, round, "Reworking after review feedback");
                }
                ReviewOutcome::Rejected => {
                    self.ctx.metrics.record_error();
                    self.notify(
                        MessageKind::Error,
                        &agent,
                        COORDINATOR_AGENT,
                        json!({ "task_id": task.id, "error": "rejected by review" }),
                    );
                    warn!(task_id = %task.id, score = verdict.result.score, iterations = verdict.iterations, "Task rejected");
                    return TaskOutcome::Rejected;
                }
            }
        }
    }

    /// Branch (first round), commit, push, and open the pull request once.
    async fn publish(
        &self,
        change: &ChangeRequest,
        output: &ExecutionOutput,
        round: u32,
        artifacts: &mut TaskArtifacts,
    ) -> ForemanResult<()> {
        let workspace = &self.ctx.config.workspace_dir;
        let paths: Vec<PathBuf> = output.files.keys().map(|p| workspace.join(p)).collect();

        if artifacts.branch.is_none() {
            self.vcs.create_branch(change).await?;
            artifacts.branch = Some(change.branch.clone());
        }
        let commit = self
            .vcs
            .commit_changes(change, &paths, &change.commit_message(round))
            .await?;
        artifacts.commit = Some(commit);
        self.vcs.push_branch(&change.branch).await?;
        if artifacts.pr_url.is_none() {
            let pr = self.vcs.create_pr(change).await?;
            artifacts.pr_url = Some(pr.url);
            artifacts.pr_number = Some(pr.number);
        }
        for path in output.files.keys() {
            if !artifacts.files.contains(path) {
                artifacts.files.push(path.clone());
            }
        }
        artifacts.files.sort();
        Ok(())
    }

    async fn request_review(
        &self,
        agent: &str,
        submission: &Submission,
        timeout: Duration,
    ) -> ForemanResult<ReviewVerdict> {
        let request = Message::new(
            MessageKind::Submission,
            agent,
            REVIEWER_AGENT,
            serde_json::to_value(submission)?,
        );
        let reply = self.ctx.bus.request(request, timeout).await?;
        let reply: ReviewReply = reply.payload_as()?;
        match (reply.verdict, reply.error) {
            (Some(verdict), _) => Ok(verdict),
            (None, error) => Err(ForemanError::Orchestrator(format!(
                "review failed: {}",
                error.unwrap_or_else(|| "no verdict in reply".into())
            ))),
        }
    }

    /// Critical errors fail the task and stop the run. Transient errors are
    /// retried with backoff up to the backend retry policy; after that, and
    /// for recoverable errors, the operator decides under a deadline.
    async fn resolve(&self, task: &Task, err: ForemanError, attempts: &mut Attempts) -> Resolution {
        let severity = err.severity();
        if severity == ErrorSeverity::Transient {
            let policy = &self.ctx.config.backend.retry;
            if attempts.transient < policy.max_retries {
                let delay = compute_backoff(policy, attempts.transient);
                attempts.transient += 1;
                info!(
                    task_id = %task.id,
                    attempt = attempts.transient,
                    delay_ms = delay,
                    error = %err,
                    "Transient error, backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                return Resolution::Retry;
            }
            warn!(task_id = %task.id, attempts = attempts.transient, error = %err, "Transient retries exhausted");
        }
        if severity == ErrorSeverity::Critical {
            error!(task_id = %task.id, title = %task.title, error = %err, "Critical error");
            self.ctx.metrics.record_error();
            if let Err(e) = self.scheduler.mark_failed(&task.id, err.to_string()).await {
                warn!(task_id = %task.id, error = %e, "Could not mark task failed");
            }
            return Resolution::Stop(TaskOutcome::Critical(err.to_string()));
        }

        let settings = &self.ctx.config.intervention;
        if attempts.operator >= settings.max_retries {
            let reason = format!("{err} (gave up after {} retries)", attempts.operator);
            warn!(task_id = %task.id, retries = attempts.operator, error = %err, "Retries exhausted");
            self.ctx.metrics.record_error();
            if let Err(e) = self.scheduler.mark_failed(&task.id, reason.clone()).await {
                warn!(task_id = %task.id, error = %e, "Could not mark task failed");
            }
            return Resolution::Stop(TaskOutcome::Failed(reason));
        }

        let risk = match severity {
            ErrorSeverity::Transient => RiskLevel::Low,
            _ => RiskLevel::Medium,
        };
        let request = InterventionRequest::new(
            task.id.as_str(),
            format!("Task '{}' hit a {severity} error", task.title),
            risk,
        )
        .with_context(err.to_string());
        let outcome = request_with_deadline(
            self.intervention.as_ref(),
            request,
            Duration::from_secs(settings.timeout_secs),
            settings.default_action,
        )
        .await;
        self.ctx.log(RunEvent::Intervention {
            task_id: task.id.to_string(),
            action: outcome.action.to_string(),
            source: source_label(outcome.source).to_string(),
        });

        match outcome.action {
            InterventionAction::Retry => {
                attempts.operator += 1;
                attempts.transient = 0;
                info!(task_id = %task.id, attempt = attempts.operator, "Retrying after intervention");
                Resolution::Retry
            }
            InterventionAction::Skip => {
                self.ctx.metrics.record_error();
                if let Err(e) = self
                    .scheduler
                    .mark_skipped(&task.id, format!("skipped after error: {err}"))
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Could not mark task skipped");
                }
                Resolution::Stop(TaskOutcome::Skipped)
            }
            InterventionAction::Halt => {
                if let Err(e) = self
                    .scheduler
                    .mark_skipped(&task.id, format!("run halted by operator after error: {err}"))
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Could not mark task skipped");
                }
                Resolution::Stop(TaskOutcome::HaltRequested)
            }
        }
    }

    async fn abandon(&self, task: &Task) -> TaskOutcome {
        info!(task_id = %task.id, "Run halted, abandoning task");
        if let Err(e) = self
            .scheduler
            .mark_skipped(&task.id, "abandoned: run halted")
            .await
        {
            warn!(task_id = %task.id, error = %e, "Could not mark task skipped");
        }
        TaskOutcome::Abandoned
    }

    async fn refused(&self, task: &Task, err: ForemanError) -> TaskOutcome {
        warn!(task_id = %task.id, error = %err, "Scheduler refused submission");
        self.ctx.metrics.record_error();
        if let Err(e) = self.scheduler.mark_failed(&task.id, err.to_string()).await {
            debug!(task_id = %task.id, error = %e, "Task already settled");
        }
        TaskOutcome::Failed(err.to_string())
    }

    fn notify(&self, kind: MessageKind, from: &str, to: &str, payload: serde_json::Value) {
        if let Err(e) = self.ctx.bus.send(Message::new(kind, from, to, payload)) {
            debug!(error = %e, "Bus notification not delivered");
        }
    }
}

fn executor_agent(task: &Task) -> String {
    format!("executor-{}", task.id)
}

fn source_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Operator => "operator",
        DecisionSource::Timeout => "timeout",
        DecisionSource::Unavailable => "unavailable",
    }
}

/// The task prompt followed by every round of review feedback so far.
pub fn build_prompt(task: &Task, feedback: &[String]) -> String {
    let mut prompt = task.prompt();
    if !feedback.is_empty() {
        prompt.push_str("\n\nReview feedback to address:");
        for (i, text) in feedback.iter().enumerate() {
            prompt.push_str(&format!("\n\nRound {}:\n{text}", i + 1));
        }
    }
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ForemanConfig;
    use crate::priority::PriorityWeights;
    use crate::review::{BaselineReviewer, BlockingIssue, BlockingIssueKind, ReviewResult, Reviewer};
    use crate::types::TaskStatus;
    use async_trait::async_trait;
    use foreman_agent::vcs::LocalVcs;
    use foreman_agent::PullRequestRef;
    use foreman_core::intervention::FixedActionChannel;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        failures: AtomicU32,
        error: fn() -> ForemanError,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _prompt: &str, _workspace: &Path) -> ForemanResult<ExecutionOutput> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            let mut files = BTreeMap::new();
            files.insert(
                "src/lib.rs".to_string(),
                "/// Adds.\npub fn add() {}\n#[test]\nfn adds() {}\n".to_string(),
            );
            Ok(ExecutionOutput {
                files,
                tokens_used: 100,
                summary: "done".into(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct Approve;

    #[async_trait]
    impl Reviewer for Approve {
        async fn review(&self, _submission: &Submission) -> ForemanResult<ReviewResult> {
            Ok(ReviewResult::new(95.0, vec![]))
        }
    }

    async fn setup(
        failures: u32,
        error: fn() -> ForemanError,
        action: InterventionAction,
        reviewer: Arc<dyn Reviewer>,
    ) -> (TaskExecutor, Arc<Scheduler>, RunContext, Task) {
        setup_with(
            ForemanConfig::default(),
            Arc::new(LocalVcs::new()),
            failures,
            error,
            action,
            reviewer,
        )
        .await
    }

    async fn setup_with(
        config: ForemanConfig,
        vcs: Arc<dyn VersionControl>,
        failures: u32,
        error: fn() -> ForemanError,
        action: InterventionAction,
        reviewer: Arc<dyn Reviewer>,
    ) -> (TaskExecutor, Arc<Scheduler>, RunContext, Task) {
        let ctx = RunContext::new(config);
        let scheduler = Arc::new(Scheduler::new(1, PriorityWeights::default()));
        let cycle = Arc::new(
            ReviewCycle::new(Arc::clone(&scheduler), reviewer, Default::default()).unwrap(),
        );
        cycle.attach(&ctx.bus);
        scheduler
            .enqueue(Task::new("T1", "Add function").with_criteria(["adds"]))
            .await
            .unwrap();
        let task = scheduler.next_ready(1).await.remove(0);
        let executor = TaskExecutor::new(
            ctx.clone(),
            Arc::clone(&scheduler),
            cycle,
            Arc::new(FlakyBackend {
                failures: AtomicU32::new(failures),
                error,
            }),
            vcs,
            Arc::new(FixedActionChannel::new(action)),
        );
        (executor, scheduler, ctx, task)
    }

    /// Local VCS whose pushes fail a number of times first.
    struct FlakyPush {
        inner: LocalVcs,
        failures: AtomicU32,
    }

    #[async_trait]
    impl VersionControl for FlakyPush {
        fn name(&self) -> &str {
            "flaky-push"
        }

        async fn create_branch(&self, change: &ChangeRequest) -> ForemanResult<()> {
            self.inner.create_branch(change).await
        }

        async fn commit_changes(
            &self,
            change: &ChangeRequest,
            paths: &[PathBuf],
            message: &str,
        ) -> ForemanResult<String> {
            self.inner.commit_changes(change, paths, message).await
        }

        async fn push_branch(&self, branch: &str) -> ForemanResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ForemanError::Http("503 Service Unavailable".into()));
            }
            self.inner.push_branch(branch).await
        }

        async fn create_pr(&self, change: &ChangeRequest) -> ForemanResult<PullRequestRef> {
            self.inner.create_pr(change).await
        }
    }

    /// Answers each review after `delay`, from a queue of results.
    struct DelayedReviewer {
        delay: Duration,
        results: std::sync::Mutex<Vec<ReviewResult>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reviewer for DelayedReviewer {
        async fn review(&self, _submission: &Submission) -> ForemanResult<ReviewResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.results.lock().unwrap().remove(0))
        }
    }

    fn execution_error() -> ForemanError {
        ForemanError::Execution("backend crashed".into())
    }

    #[tokio::test]
    async fn test_task_completes_and_records_artifacts() {
        let (executor, scheduler, ctx, task) =
            setup(0, execution_error, InterventionAction::Skip, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Completed);

        let done = scheduler.task(&"T1".into()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.artifacts.branch.as_deref().unwrap().starts_with("foreman/t1"));
        assert!(done.artifacts.pr_url.is_some());
        assert_eq!(done.artifacts.files, vec!["src/lib.rs".to_string()]);
        assert_eq!(ctx.metrics.tokens_used(), 100);

        let kinds: Vec<MessageKind> = ctx.bus.history().iter().map(|m| m.kind).collect();
        assert_eq!(kinds.first(), Some(&MessageKind::Assignment));
        assert!(kinds.contains(&MessageKind::Submission));
        assert_eq!(kinds.last(), Some(&MessageKind::Completion));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (executor, scheduler, _ctx, task) =
            setup(1, execution_error, InterventionAction::Retry, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Completed);
        assert_eq!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_skip_after_error() {
        let (executor, scheduler, ctx, task) =
            setup(1, execution_error, InterventionAction::Skip, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Skipped);
        assert!(matches!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Skipped { .. }
        ));
        assert_eq!(ctx.metrics.errors(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let (executor, scheduler, _ctx, task) =
            setup(10, execution_error, InterventionAction::Retry, Arc::new(Approve)).await;
        let outcome = executor.run(task).await;
        assert!(matches!(outcome, TaskOutcome::Failed(ref r) if r.contains("gave up after 3 retries")));
        assert!(matches!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Failed { .. }
        ));
    }

    fn unavailable() -> ForemanError {
        ForemanError::Http("503 Service Unavailable".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_backend_error_retried_without_operator() {
        let (executor, _scheduler, ctx, task) =
            setup(2, unavailable, InterventionAction::Skip, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Completed);
        assert_eq!(ctx.metrics.errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_push_error_retried() {
        let vcs = Arc::new(FlakyPush {
            inner: LocalVcs::new(),
            failures: AtomicU32::new(1),
        });
        let (executor, scheduler, _ctx, task) = setup_with(
            ForemanConfig::default(),
            vcs,
            0,
            execution_error,
            InterventionAction::Skip,
            Arc::new(Approve),
        )
        .await;
        assert_eq!(executor.run(task).await, TaskOutcome::Completed);
        let done = scheduler.task(&"T1".into()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.artifacts.pr_url.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transient_error_escalates() {
        let (executor, scheduler, _ctx, task) =
            setup(10, unavailable, InterventionAction::Skip, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Skipped);
        assert!(matches!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Skipped { ref reason } if reason.contains("503")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_review_feedback_is_applied() {
        let mut config = ForemanConfig::default();
        config.orchestrator.review_timeout_secs = 1;
        let reviewer = Arc::new(DelayedReviewer {
            delay: Duration::from_millis(1200),
            results: std::sync::Mutex::new(vec![
                ReviewResult::new(
                    70.0,
                    vec![BlockingIssue::new(BlockingIssueKind::MissingTests, "add tests")],
                ),
                ReviewResult::new(92.0, vec![]),
            ]),
            calls: AtomicU32::new(0),
        });
        let (executor, scheduler, _ctx, task) = setup_with(
            config,
            Arc::new(LocalVcs::new()),
            0,
            execution_error,
            InterventionAction::Skip,
            reviewer.clone(),
        )
        .await;

        assert_eq!(executor.run(task).await, TaskOutcome::Completed);
        let done = scheduler.task(&"T1".into()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.review_iterations, 1);
        assert_eq!(reviewer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_critical_error_fails_task() {
        let (executor, scheduler, _ctx, task) = setup(
            1,
            || ForemanError::ResourceExhausted("disk full".into()),
            InterventionAction::Retry,
            Arc::new(Approve),
        )
        .await;
        let outcome = executor.run(task).await;
        assert!(matches!(outcome, TaskOutcome::Critical(ref r) if r.contains("disk full")));
        assert!(matches!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_operator_halt() {
        let (executor, scheduler, _ctx, task) =
            setup(1, execution_error, InterventionAction::Halt, Arc::new(Approve)).await;
        assert_eq!(executor.run(task).await, TaskOutcome::HaltRequested);
        assert!(scheduler.task(&"T1".into()).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_halted_run_abandons_task() {
        let (executor, scheduler, _ctx, task) =
            setup(0, execution_error, InterventionAction::Skip, Arc::new(Approve)).await;
        scheduler.halt();
        assert_eq!(executor.run(task).await, TaskOutcome::Abandoned);
        assert!(matches!(
            scheduler.task(&"T1".into()).await.unwrap().status,
            TaskStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_baseline_review_approves_complete_work() {
        let reviewer = Arc::new(BaselineReviewer::new(Default::default()));
        let (executor, _scheduler, _ctx, task) =
            setup(0, execution_error, InterventionAction::Skip, reviewer).await;
        assert_eq!(executor.run(task).await, TaskOutcome::Completed);
    }

    #[test]
    fn test_prompt_accumulates_feedback() {
        let task = Task::new("T1", "Parser").with_criteria(["parses keys"]);
        assert_eq!(build_prompt(&task, &[]), task.prompt());

        let prompt = build_prompt(&task, &["add tests".into(), "add docs".into()]);
        assert!(prompt.starts_with(&task.prompt()));
        assert!(prompt.contains("Round 1:\nadd tests"));
        assert!(prompt.contains("Round 2:\nadd docs"));
    }
}
