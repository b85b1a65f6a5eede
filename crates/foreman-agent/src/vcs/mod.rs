/// libgit2-backed implementation.
pub mod git;
/// GitHub REST client for pull requests.
pub mod github;
/// In-memory implementation.
pub mod local;

pub use git::GitVcs;
pub use github::{GitHubClient, GitHubConfig};
pub use local::{LocalVcs, VcsOperation};

use async_trait::async_trait;
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything the version-control collaborator needs to know about a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Task identifier.
    pub task_id: String,
    /// Task title, used for commit and PR titles.
    pub title: String,
    /// PR body: description and acceptance criteria.
    pub body: String,
    /// Branch the work lands on.
    pub branch: String,
    /// Branch the pull request targets.
    pub base_branch: String,
}

impl ChangeRequest {
    /// Build a change request, deriving the branch name from the task.
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        let title = title.into();
        Self {
            branch: branch_name(&task_id, &title),
            task_id,
            title,
            body: body.into(),
            base_branch: base_branch.into(),
        }
    }

    /// Commit message for a review round (1-based).
    pub fn commit_message(&self, round: u32) -> String {
        if round <= 1 {
            format!("{}: {}", self.task_id, self.title)
        } else {
            format!("{}: address review feedback (round {round})", self.task_id)
        }
    }
}

/// `foreman/<task-id>-<slug>`, with the slug limited to `[a-z0-9-]`.
pub fn branch_name(task_id: &str, title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    let id: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() {
        format!("foreman/{id}")
    } else {
        format!("foreman/{id}-{slug}")
    }
}

/// A created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// Browser URL.
    pub url: String,
    /// PR number.
    pub number: u64,
}

/// Version-control capability used by the executor between backend
/// completion and review submission.
///
/// Failures are reported as [`foreman_core::ForemanError::Vcs`] and are
/// recoverable.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Create (or switch to) the task branch.
    async fn create_branch(&self, change: &ChangeRequest) -> ForemanResult<()>;

    /// Stage `paths` (relative to the repository root) and commit them.
    /// Returns the commit identifier.
    async fn commit_changes(
        &self,
        change: &ChangeRequest,
        paths: &[PathBuf],
        message: &str,
    ) -> ForemanResult<String>;

    /// Push a branch to the remote.
    async fn push_branch(&self, branch: &str) -> ForemanResult<()>;

    /// Open a pull request for the task branch.
    async fn create_pr(&self, change: &ChangeRequest) -> ForemanResult<PullRequestRef>;
}

/// Which version-control collaborator to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    /// Record operations in memory.
    #[default]
    Local,
    /// A real git repository.
    Git,
}

/// The `[vcs]` table of `foreman.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Implementation.
    #[serde(default)]
    pub kind: VcsKind,
    /// Repository path; defaults to the workspace directory.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Remote pushed to.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Branch pull requests target.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Whether `push_branch` talks to the remote at all.
    #[serde(default = "default_push")]
    pub push: bool,
    /// GitHub settings for pull requests.
    #[serde(default)]
    pub github: Option<GitHubConfig>,
}

fn default_remote() -> String {
    "origin".into()
}

fn default_base_branch() -> String {
    "main".into()
}

fn default_push() -> bool {
    true
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            kind: VcsKind::default(),
            repo_path: None,
            remote: default_remote(),
            base_branch: default_base_branch(),
            push: default_push(),
            github: None,
        }
    }
}

/// Build the configured collaborator for a workspace.
pub fn build_vcs(config: &VcsConfig, workspace: &Path) -> ForemanResult<Arc<dyn VersionControl>> {
    let vcs: Arc<dyn VersionControl> = match config.kind {
        VcsKind::Local => Arc::new(LocalVcs::new()),
        VcsKind::Git => {
            let repo = config
                .repo_path
                .clone()
                .unwrap_or_else(|| workspace.to_path_buf());
            let github = config
                .github
                .as_ref()
                .map(GitHubClient::from_config)
                .transpose()?;
            Arc::new(GitVcs::new(repo, config.remote.clone(), config.push, github))
        }
    };
    tracing::info!(vcs = vcs.name(), "Version control configured");
    Ok(vcs)
}
