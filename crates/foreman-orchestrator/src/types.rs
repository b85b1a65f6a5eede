use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a task, unique within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of work, used for the base priority score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Project scaffolding and configuration.
    Setup,
    /// Fixing broken behaviour.
    Bugfix,
    /// New functionality.
    #[default]
    Feature,
    /// Test coverage.
    Test,
    /// Restructuring without behaviour change.
    Refactor,
    /// Docs and examples.
    Documentation,
}

impl TaskCategory {
    /// Infer a category from the leading keyword of a task title.
    pub fn from_keyword(word: &str) -> Option<Self> {
        let word = word
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_lowercase();
        match word.as_str() {
            "setup" | "set" | "init" | "initialize" | "scaffold" | "configure" | "bootstrap" => {
                Some(TaskCategory::Setup)
            }
            "fix" | "bug" | "bugfix" | "repair" | "patch" => Some(TaskCategory::Bugfix),
            "test" | "tests" | "verify" | "cover" => Some(TaskCategory::Test),
            "refactor" | "cleanup" | "restructure" | "simplify" => Some(TaskCategory::Refactor),
            "doc" | "docs" | "document" | "readme" => Some(TaskCategory::Documentation),
            "add" | "implement" | "build" | "create" | "support" | "feature" => {
                Some(TaskCategory::Feature)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskCategory::Setup => write!(f, "setup"),
            TaskCategory::Bugfix => write!(f, "bugfix"),
            TaskCategory::Feature => write!(f, "feature"),
            TaskCategory::Test => write!(f, "test"),
            TaskCategory::Refactor => write!(f, "refactor"),
            TaskCategory::Documentation => write!(f, "documentation"),
        }
    }
}

/// Status of a task in the graph.
///
/// `Ready` is only reachable once every dependency is `Completed`.
/// `Completed`, `Failed` and `Skipped` are terminal; only an operator retry
/// moves a task out of `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies satisfied, waiting for a slot.
    Ready,
    /// Holding a slot, backend or rework in progress.
    Running,
    /// Submitted, waiting for the review verdict.
    AwaitingReview,
    /// Approved.
    Completed,
    /// Rejected or errored.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Abandoned by an operator decision.
    Skipped {
        /// Why the task was skipped.
        reason: String,
    },
}

impl TaskStatus {
    /// Short label used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }

    /// Whether no further transition happens without an operator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    /// Whether the task currently holds an execution slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::AwaitingReview)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What a task produced on its way through version control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArtifacts {
    /// Task branch.
    pub branch: Option<String>,
    /// Latest commit.
    pub commit: Option<String>,
    /// Pull request number.
    pub pr_number: Option<u64>,
    /// Pull request URL.
    pub pr_url: Option<String>,
    /// Generated files, relative to the workspace.
    pub files: Vec<String>,
}

/// A unit of work with acceptance criteria, dependencies and a lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// One-line title.
    pub title: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Tasks that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Kind of work.
    #[serde(default)]
    pub category: TaskCategory,
    /// Explicit priority added to the category base.
    #[serde(default)]
    pub priority_override: Option<f64>,
    /// Last computed priority.
    #[serde(default)]
    pub priority: f64,
    /// Review rounds that ended in feedback.
    #[serde(default)]
    pub review_iterations: u32,
    /// Scheduling rounds this task was ready but passed over.
    #[serde(default)]
    pub waited_rounds: u32,
    /// Insertion order within the graph.
    #[serde(default)]
    pub sequence: u64,
    /// Branch, commit, PR and files.
    #[serde(default)]
    pub artifacts: TaskArtifacts,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A new pending task.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            category: TaskCategory::default(),
            priority_override: None,
            priority: 0.0,
            review_iterations: 0,
            waited_rounds: 0,
            sequence: 0,
            artifacts: TaskArtifacts::default(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the acceptance criteria.
    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    /// Set the dependencies.
    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    /// Set an explicit priority bonus.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority_override = Some(priority);
        self
    }

    /// Whether the task reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The text handed to the backend: title, description and criteria.
    pub fn prompt(&self) -> String {
        let mut prompt = self.title.clone();
        if !self.description.trim().is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(self.description.trim());
        }
        if !self.acceptance_criteria.is_empty() {
            prompt.push_str("\n\nAcceptance criteria:");
            for criterion in &self.acceptance_criteria {
                prompt.push_str("\n- ");
                prompt.push_str(criterion);
            }
        }
        prompt
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("T1", "Implement auth module")
            .with_dependencies(["T0"])
            .with_category(TaskCategory::Setup);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.dependencies.contains(&TaskId::from("T0")));
        assert_eq!(task.category, TaskCategory::Setup);
        assert!(task.priority_override.is_none());
    }

    #[test]
    fn test_prompt_includes_criteria() {
        let task = Task::new("T1", "Add login")
            .with_description("Session based.")
            .with_criteria(["rejects bad passwords", "locks after 5 attempts"]);
        let prompt = task.prompt();
        assert!(prompt.starts_with("Add login\n\nSession based."));
        assert!(prompt.contains("- locks after 5 attempts"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped { reason: "x".into() }.is_terminal());
        assert!(!TaskStatus::AwaitingReview.is_terminal());
        assert!(TaskStatus::AwaitingReview.holds_slot());
        assert!(!TaskStatus::Ready.holds_slot());
    }

    #[test]
    fn test_category_keywords() {
        assert_eq!(TaskCategory::from_keyword("Fix"), Some(TaskCategory::Bugfix));
        assert_eq!(TaskCategory::from_keyword("docs:"), Some(TaskCategory::Documentation));
        assert_eq!(TaskCategory::from_keyword("Setup"), Some(TaskCategory::Setup));
        assert_eq!(TaskCategory::from_keyword("Frobnicate"), None);
    }

    #[test]
    fn test_task_status_serialization() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
