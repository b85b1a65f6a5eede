use super::{ChangeRequest, PullRequestRef, VersionControl};
use async_trait::async_trait;
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// One recorded version-control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VcsOperation {
    /// `create_branch`.
    CreateBranch {
        /// Branch name.
        branch: String,
    },
    /// `commit_changes`.
    Commit {
        /// Branch committed on.
        branch: String,
        /// Synthetic commit id.
        commit: String,
        /// Commit message.
        message: String,
        /// Paths included.
        files: Vec<PathBuf>,
    },
    /// `push_branch`.
    Push {
        /// Branch pushed.
        branch: String,
    },
    /// `create_pr`.
    OpenPullRequest {
        /// Head branch.
        branch: String,
        /// Synthetic PR number.
        number: u64,
    },
}

#[derive(Default)]
struct LocalState {
    operations: Vec<VcsOperation>,
    commits: u64,
    pulls: u64,
}

/// Version control that only records what it was asked to do.
///
/// Pull requests get sequential numbers and `local://` URLs. Used for dry
/// runs and as the default when no repository is configured.
#[derive(Default)]
pub struct LocalVcs {
    state: Mutex<LocalState>,
}

impl LocalVcs {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation recorded so far, in call order.
    pub async fn operations(&self) -> Vec<VcsOperation> {
        self.state.lock().await.operations.clone()
    }
}

#[async_trait]
impl VersionControl for LocalVcs {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_branch(&self, change: &ChangeRequest) -> ForemanResult<()> {
        self.state
            .lock()
            .await
            .operations
            .push(VcsOperation::CreateBranch {
                branch: change.branch.clone(),
            });
        Ok(())
    }

    async fn commit_changes(
        &self,
        change: &ChangeRequest,
        paths: &[PathBuf],
        message: &str,
    ) -> ForemanResult<String> {
        let mut state = self.state.lock().await;
        state.commits += 1;
        let commit = format!("local-{:07}", state.commits);
        state.operations.push(VcsOperation::Commit {
            branch: change.branch.clone(),
            commit: commit.clone(),
            message: message.to_string(),
            files: paths.to_vec(),
        });
        Ok(commit)
    }

    async fn push_branch(&self, branch: &str) -> ForemanResult<()> {
        self.state.lock().await.operations.push(VcsOperation::Push {
            branch: branch.to_string(),
        });
        Ok(())
    }

    async fn create_pr(&self, change: &ChangeRequest) -> ForemanResult<PullRequestRef> {
        let mut state = self.state.lock().await;
        state.pulls += 1;
        let number = state.pulls;
        state.operations.push(VcsOperation::OpenPullRequest {
            branch: change.branch.clone(),
            number,
        });
        Ok(PullRequestRef {
            url: format!("local://pulls/{number}"),
            number,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_operations_in_order() {
        let vcs = LocalVcs::new();
        let change = ChangeRequest::new("T1", "Add login", "", "main");

        vcs.create_branch(&change).await.unwrap();
        let commit = vcs
            .commit_changes(&change, &[PathBuf::from("src/login.rs")], "T1: Add login")
            .await
            .unwrap();
        vcs.push_branch(&change.branch).await.unwrap();
        let pr = vcs.create_pr(&change).await.unwrap();

        assert_eq!(commit, "local-0000001");
        assert_eq!(pr.number, 1);
        assert_eq!(pr.url, "local://pulls/1");

        let ops = vcs.operations().await;
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[0], VcsOperation::CreateBranch { .. }));
        assert!(matches!(ops[3], VcsOperation::OpenPullRequest { number: 1, .. }));
    }

    #[tokio::test]
    async fn test_pull_request_numbers_increase() {
        let vcs = LocalVcs::new();
        let a = vcs
            .create_pr(&ChangeRequest::new("T1", "a", "", "main"))
            .await
            .unwrap();
        let b = vcs
            .create_pr(&ChangeRequest::new("T2", "b", "", "main"))
            .await
            .unwrap();
        assert_eq!((a.number, b.number), (1, 2));
    }
}
