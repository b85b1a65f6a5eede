//! Review of submitted work: scoring, feedback rounds and the final verdict.
//!
//! A submission is scored by a [`Reviewer`], normalized against the approval
//! threshold, then resolved by [`decide`] into approval, another feedback
//! round, or rejection. The [`ReviewCycle`] applies that verdict through the
//! scheduler and answers review requests arriving on the message bus.

use crate::scheduler::Scheduler;
use crate::types::{TaskId, TaskStatus};
use async_trait::async_trait;
use foreman_bus::{Message, MessageBus, MessageKind, SubscriptionId};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Bus identity of the review cycle.
pub const REVIEWER_AGENT: &str = "reviewer";

/// Weight of each sub-score, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewWeights {
    /// Code quality weight.
    #[serde(default = "default_code_quality")]
    pub code_quality: u32,
    /// Testing weight.
    #[serde(default = "default_testing")]
    pub testing: u32,
    /// Documentation weight.
    #[serde(default = "default_documentation")]
    pub documentation: u32,
    /// Acceptance-criteria weight.
    #[serde(default = "default_acceptance")]
    pub acceptance: u32,
}

fn default_code_quality() -> u32 {
    35
}
fn default_testing() -> u32 {
    30
}
fn default_documentation() -> u32 {
    20
}
fn default_acceptance() -> u32 {
    15
}

impl Default for ReviewWeights {
    fn default() -> Self {
        Self {
            code_quality: default_code_quality(),
            testing: default_testing(),
            documentation: default_documentation(),
            acceptance: default_acceptance(),
        }
    }
}

impl ReviewWeights {
    /// The weights must sum to 100.
    pub fn validate(&self) -> ForemanResult<()> {
        let sum = self.code_quality + self.testing + self.documentation + self.acceptance;
        if sum == 100 {
            Ok(())
        } else {
            Err(ForemanError::Config(format!(
                "review weights must sum to 100, got {sum}"
            )))
        }
    }

    /// Weighted score in [0, 100].
    pub fn score(&self, sub: &SubScores) -> f64 {
        let total = f64::from(self.code_quality) * sub.code_quality
            + f64::from(self.testing) * sub.testing
            + f64::from(self.documentation) * sub.documentation
            + f64::from(self.acceptance) * sub.acceptance;
        (total / 100.0).clamp(0.0, 100.0)
    }
}

/// Per-dimension scores, each in [0, 100].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    /// Code quality.
    pub code_quality: f64,
    /// Tests.
    pub testing: f64,
    /// Documentation.
    pub documentation: f64,
    /// Acceptance criteria coverage.
    pub acceptance: f64,
}

/// Problems that block approval regardless of score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingIssueKind {
    /// The lint report is not clean.
    LintFailure,
    /// Placeholder or obviously broken code.
    ObviousBug,
    /// Tests are required but absent.
    MissingTests,
    /// Tests ran and failed.
    FailingTests,
    /// Acceptance criteria are not addressed.
    UnmetAcceptanceCriteria,
}

/// A blocking issue with a description for the next round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingIssue {
    /// Issue class.
    pub kind: BlockingIssueKind,
    /// What to fix.
    pub description: String,
}

impl BlockingIssue {
    /// Build an issue.
    pub fn new(kind: BlockingIssueKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

/// Outcome of scoring one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Weighted score in [0, 100].
    pub score: f64,
    /// Sub-scores the score was computed from.
    #[serde(default)]
    pub sub_scores: SubScores,
    /// Issues blocking approval.
    #[serde(default)]
    pub blocking_issues: Vec<BlockingIssue>,
    /// Non-blocking suggestions.
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// `score >= threshold` and no blocking issue.
    pub approved: bool,
}

impl ReviewResult {
    /// Result with the given score and issues; `approved` is filled in by
    /// [`ReviewResult::normalized`].
    pub fn new(score: f64, blocking_issues: Vec<BlockingIssue>) -> Self {
        Self {
            score,
            sub_scores: SubScores::default(),
            blocking_issues,
            suggestions: Vec::new(),
            approved: false,
        }
    }

    /// Add suggestions.
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Clamp the score and recompute `approved` against `threshold`.
    pub fn normalized(mut self, threshold: f64) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 100.0)
        };
        self.approved = self.score >= threshold && self.blocking_issues.is_empty();
        self
    }

    /// Feedback text for the next backend round.
    pub fn feedback_text(&self) -> String {
        let mut text = format!("Review score {:.0}/100.", self.score);
        if !self.blocking_issues.is_empty() {
            text.push_str("\nBlocking issues:");
            for issue in &self.blocking_issues {
                text.push_str(&format!("\n- {}", issue.description));
            }
        }
        if !self.suggestions.is_empty() {
            text.push_str("\nSuggestions:");
            for s in &self.suggestions {
                text.push_str(&format!("\n- {s}"));
            }
        }
        text
    }
}

/// Work submitted for review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Task the work belongs to.
    pub task_id: TaskId,
    /// Task title.
    pub title: String,
    /// Criteria the work must meet.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Generated files, path to content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Lint report, when one was produced.
    #[serde(default)]
    pub lint_clean: Option<bool>,
    /// Test run result, when tests were run.
    #[serde(default)]
    pub tests_passed: Option<bool>,
    /// Round number, starting at 1.
    #[serde(default)]
    pub iteration: u32,
    /// Pull request under review.
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Backend summary.
    #[serde(default)]
    pub summary: String,
}

/// Scores submissions.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Score one submission.
    async fn review(&self, submission: &Submission) -> ForemanResult<ReviewResult>;
}

/// Reviewer based on presence checks only: tests present, docs present,
/// acceptance criteria mentioned, lint and test reports clean.
#[derive(Debug, Clone, Default)]
pub struct BaselineReviewer {
    weights: ReviewWeights,
}

impl BaselineReviewer {
    /// Create a reviewer using `weights`.
    pub fn new(weights: ReviewWeights) -> Self {
        Self { weights }
    }

    /// Score a submission synchronously.
    pub fn assess(&self, submission: &Submission) -> ReviewResult {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();
        let corpus: String = submission
            .files
            .iter()
            .map(|(path, content)| format!("{path}\n{content}\n"))
            .collect::<String>()
            .to_lowercase();

        let mut code_quality: f64 = if submission.files.is_empty() { 0.0 } else { 100.0 };
        if submission.files.is_empty() {
            issues.push(BlockingIssue::new(
                BlockingIssueKind::ObviousBug,
                "the submission contains no files",
            ));
        }
        if submission.lint_clean == Some(false) {
            code_quality -= 60.0;
            issues.push(BlockingIssue::new(
                BlockingIssueKind::LintFailure,
                "lint report is not clean",
            ));
        }
        let placeholders: Vec<_> = submission
            .files
            .iter()
            .filter(|(_, c)| c.contains("todo!(") || c.contains("unimplemented!("))
            .map(|(p, _)| p.as_str())
            .collect();
        if !placeholders.is_empty() {
            code_quality -= 30.0;
            issues.push(BlockingIssue::new(
                BlockingIssueKind::ObviousBug,
                format!("placeholder code left in {}", placeholders.join(", ")),
            ));
        }

        let has_tests = submission.files.iter().any(|(path, content)| {
            path.contains("test")
                || content.contains("#[test]")
                || content.contains("#[tokio::test]")
                || content.contains("def test_")
                || content.contains("describe(")
        });
        let testing = match (has_tests, submission.tests_passed) {
            (_, Some(false)) => {
                issues.push(BlockingIssue::new(
                    BlockingIssueKind::FailingTests,
                    "the test run failed",
                ));
                20.0
            }
            (true, _) => 100.0,
            (false, _) => {
                let required = submission
                    .acceptance_criteria
                    .iter()
                    .any(|c| c.to_lowercase().contains("test"));
                if required {
                    issues.push(BlockingIssue::new(
                        BlockingIssueKind::MissingTests,
                        "acceptance criteria ask for tests but none were submitted",
                    ));
                } else {
                    suggestions.push("add tests covering the new behaviour".to_string());
                }
                0.0
            }
        };

        let has_docs = submission.files.iter().any(|(path, content)| {
            path.ends_with(".md")
                || content.contains("///")
                || content.contains("//!")
                || content.contains("\"\"\"")
        });
        let documentation = if has_docs {
            100.0
        } else {
            suggestions.push("document the public items".to_string());
            0.0
        };

        let unmet: Vec<&str> = submission
            .acceptance_criteria
            .iter()
            .map(String::as_str)
            .filter(|c| !criterion_mentioned(c, &corpus))
            .collect();
        let acceptance = if submission.acceptance_criteria.is_empty() {
            100.0
        } else {
            let met = submission.acceptance_criteria.len() - unmet.len();
            100.0 * met as f64 / submission.acceptance_criteria.len() as f64
        };
        if !unmet.is_empty() {
            let list = unmet.join("; ");
            if acceptance < 50.0 {
                issues.push(BlockingIssue::new(
                    BlockingIssueKind::UnmetAcceptanceCriteria,
                    format!("criteria not addressed: {list}"),
                ));
            } else {
                suggestions.push(format!("address the remaining criteria: {list}"));
            }
        }

        let sub_scores = SubScores {
            code_quality: code_quality.max(0.0),
            testing,
            documentation,
            acceptance,
        };
        let mut result = ReviewResult::new(self.weights.score(&sub_scores), issues)
            .with_suggestions(suggestions);
        result.sub_scores = sub_scores;
        result
    }
}

#[async_trait]
impl Reviewer for BaselineReviewer {
    async fn review(&self, submission: &Submission) -> ForemanResult<ReviewResult> {
        Ok(self.assess(submission))
    }
}

/// A criterion counts as mentioned when at least half of its significant
/// words appear in the submission.
fn criterion_mentioned(criterion: &str, corpus: &str) -> bool {
    let words: Vec<String> = criterion
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        return true;
    }
    let found = words.iter().filter(|w| corpus.contains(w.as_str())).count();
    found * 2 >= words.len()
}

/// Review settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Sub-score weights.
    #[serde(default)]
    pub weights: ReviewWeights,
    /// Minimum score for approval.
    #[serde(default = "default_threshold")]
    pub approval_threshold: f64,
    /// Feedback rounds before a failing review rejects the task.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_threshold() -> f64 {
    80.0
}
fn default_max_iterations() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            weights: ReviewWeights::default(),
            approval_threshold: default_threshold(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Verdict on one scored submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// Work accepted.
    Approved,
    /// Another round requested.
    FeedbackSent,
    /// Feedback rounds exhausted.
    Rejected,
}

/// Approve, send feedback while `iterations < max_iterations`, else reject.
pub fn decide(result: &ReviewResult, iterations: u32, max_iterations: u32) -> ReviewOutcome {
    if result.approved {
        ReviewOutcome::Approved
    } else if iterations < max_iterations {
        ReviewOutcome::FeedbackSent
    } else {
        ReviewOutcome::Rejected
    }
}

/// Where a task stands in the review state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPhase {
    /// Waiting for a score.
    #[default]
    Submitted,
    /// Scored, verdict not applied yet.
    Scored,
    /// Approved.
    Approved,
    /// Feedback sent, waiting for resubmission.
    FeedbackSent,
    /// Rejected.
    Rejected,
}

/// Verdict plus the data behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// What happened.
    pub outcome: ReviewOutcome,
    /// The normalized review.
    pub result: ReviewResult,
    /// Feedback rounds so far.
    pub iterations: u32,
}

/// Payload of the bus reply to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReply {
    /// Verdict, absent when the review itself failed.
    #[serde(default)]
    pub verdict: Option<ReviewVerdict>,
    /// Why the review failed.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct TaskReview {
    phase: ReviewPhase,
    iterations: u32,
    /// Round currently with the reviewer.
    in_flight: Option<u32>,
    /// Last applied verdict and the round it answered.
    last: Option<(u32, ReviewVerdict)>,
}

/// Owns the review iteration counters and applies verdicts through the
/// scheduler.
///
/// At most one review per task runs at a time. A duplicate submission of
/// the round under review waits for it and receives the same verdict.
pub struct ReviewCycle {
    scheduler: Arc<Scheduler>,
    reviewer: Arc<dyn Reviewer>,
    config: ReviewConfig,
    states: Mutex<HashMap<TaskId, TaskReview>>,
    settled: Notify,
}

impl ReviewCycle {
    /// Create a cycle. The review weights are validated.
    pub fn new(
        scheduler: Arc<Scheduler>,
        reviewer: Arc<dyn Reviewer>,
        config: ReviewConfig,
    ) -> ForemanResult<Self> {
        config.weights.validate()?;
        Ok(Self {
            scheduler,
            reviewer,
            config,
            states: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        })
    }

    /// Review a submission and apply the verdict.
    ///
    /// The task must be awaiting review; submissions for terminal tasks are
    /// refused with `InvalidTransition`.
    pub async fn submit(&self, submission: Submission) -> ForemanResult<ReviewVerdict> {
        let id = submission.task_id.clone();
        let round = submission.iteration;
        let mut joined = false;

        let iterations = loop {
            let settled = self.settled.notified();
            let mut states = self.states.lock().await;
            let state = states.entry(id.clone()).or_default();
            if joined {
                if let Some((answered, verdict)) = &state.last {
                    if *answered == round {
                        debug!(task_id = %id, round, "Joined review already in progress");
                        return Ok(verdict.clone());
                    }
                }
            }
            if let Some(in_flight) = state.in_flight {
                joined = in_flight == round;
                drop(states);
                settled.await;
                continue;
            }

            let task = self.scheduler.task(&id).await?;
            if task.status != TaskStatus::AwaitingReview {
                return Err(ForemanError::InvalidTransition {
                    task: id.to_string(),
                    from: task.status.label().to_string(),
                    to: "reviewed".to_string(),
                });
            }
            state.in_flight = Some(round);
            state.phase = ReviewPhase::Submitted;
            state.iterations = task.review_iterations;
            break task.review_iterations;
        };

        let applied = match self.reviewer.review(&submission).await {
            Ok(result) => {
                self.apply(&id, result.normalized(self.config.approval_threshold), iterations)
                    .await
            }
            Err(e) => Err(e),
        };
        self.settle(&id, round, &applied).await;
        let verdict = applied?;

        info!(
            task_id = %id,
            score = verdict.result.score,
            blocking = verdict.result.blocking_issues.len(),
            iterations = verdict.iterations,
            outcome = ?verdict.outcome,
            "Review complete"
        );
        Ok(verdict)
    }

    async fn apply(
        &self,
        id: &TaskId,
        result: ReviewResult,
        iterations: u32,
    ) -> ForemanResult<ReviewVerdict> {
        if let Some(state) = self.states.lock().await.get_mut(id) {
            state.phase = ReviewPhase::Scored;
        }

        let outcome = decide(&result, iterations, self.config.max_iterations);
        let iterations = match outcome {
            ReviewOutcome::Approved => {
                self.scheduler.mark_completed(id).await?;
                iterations
            }
            ReviewOutcome::FeedbackSent => {
                let next = iterations + 1;
                self.scheduler.record_review_iteration(id, next).await?;
                self.scheduler.mark_rework(id).await?;
                next
            }
            ReviewOutcome::Rejected => {
                self.scheduler
                    .mark_failed(
                        id,
                        format!(
                            "rejected after {iterations} review iterations (score {:.0})",
                            result.score
                        ),
                    )
                    .await?;
                iterations
            }
        };
        Ok(ReviewVerdict {
            outcome,
            result,
            iterations,
        })
    }

    /// Clear the in-flight marker, record a verdict, and wake waiting
    /// duplicates.
    async fn settle(&self, id: &TaskId, round: u32, applied: &ForemanResult<ReviewVerdict>) {
        {
            let mut states = self.states.lock().await;
            let state = states.entry(id.clone()).or_default();
            state.in_flight = None;
            if let Ok(verdict) = applied {
                state.phase = match verdict.outcome {
                    ReviewOutcome::Approved => ReviewPhase::Approved,
                    ReviewOutcome::FeedbackSent => ReviewPhase::FeedbackSent,
                    ReviewOutcome::Rejected => ReviewPhase::Rejected,
                };
                state.iterations = verdict.iterations;
                state.last = Some((round, verdict.clone()));
            }
        }
        self.settled.notify_waiters();
    }

    /// The verdict applied to `round` of a task, if that round was settled.
    pub async fn verdict(&self, id: &TaskId, round: u32) -> Option<ReviewVerdict> {
        let states = self.states.lock().await;
        match &states.get(id)?.last {
            Some((answered, verdict)) if *answered == round => Some(verdict.clone()),
            _ => None,
        }
    }

    /// Current phase of a task.
    pub async fn phase(&self, id: &TaskId) -> Option<ReviewPhase> {
        self.states.lock().await.get(id).map(|s| s.phase)
    }

    /// Feedback rounds recorded for a task.
    pub async fn iterations(&self, id: &TaskId) -> u32 {
        self.states
            .lock()
            .await
            .get(id)
            .map_or(0, |s| s.iterations)
    }

    /// Subscribe the cycle to `bus` as [`REVIEWER_AGENT`].
    ///
    /// Each `Submission` request is reviewed on the runtime and answered
    /// with a `Completion` (approved), `Feedback`, or `Error` (rejected or
    /// failed review) reply carrying a [`ReviewReply`]. Unsubscribe at run
    /// end to release the cycle.
    pub fn attach(self: &Arc<Self>, bus: &MessageBus) -> SubscriptionId {
        let cycle = Arc::clone(self);
        let responder = bus.clone();
        bus.subscribe(REVIEWER_AGENT, move |message: &Message| {
            if message.kind != MessageKind::Submission {
                return Ok(());
            }
            let submission: Submission = message.payload_as()?;
            let handle = tokio::runtime::Handle::try_current().map_err(|e| {
                ForemanError::Orchestrator(format!("review requires a tokio runtime: {e}"))
            })?;
            let cycle = Arc::clone(&cycle);
            let bus = responder.clone();
            let request = message.clone();
            handle.spawn(async move {
                let (kind, reply) = match cycle.submit(submission).await {
                    Ok(verdict) => {
                        let kind = match verdict.outcome {
                            ReviewOutcome::Approved => MessageKind::Completion,
                            ReviewOutcome::FeedbackSent => MessageKind::Feedback,
                            ReviewOutcome::Rejected => MessageKind::Error,
                        };
                        (
                            kind,
                            ReviewReply {
                                verdict: Some(verdict),
                                error: None,
                            },
                        )
                    }
                    Err(e) => {
                        warn!(error = %e, "Review failed");
                        (
                            MessageKind::Error,
                            ReviewReply {
                                verdict: None,
                                error: Some(e.to_string()),
                            },
                        )
                    }
                };
                let payload = match serde_json::to_value(&reply) {
                    Ok(payload) => payload,
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                };
                if let Err(e) = bus.respond(&request, REVIEWER_AGENT, kind, payload) {
                    warn!(error = %e, "Could not deliver review reply");
                }
            });
            Ok(())
        })
    }
}
