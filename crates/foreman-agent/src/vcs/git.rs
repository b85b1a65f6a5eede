use super::github::GitHubClient;
use super::{ChangeRequest, PullRequestRef, VersionControl};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use git2::{BranchType, Cred, PushOptions, RemoteCallbacks, Repository, Signature};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn vcs_err(context: &str, e: git2::Error) -> ForemanError {
    ForemanError::Vcs(format!("{context}: {}", e.message()))
}

/// Version control over a local git repository (libgit2), with pull
/// requests opened through the GitHub REST API when a client is configured.
///
/// libgit2 calls are blocking and run on the blocking thread pool.
pub struct GitVcs {
    repo_path: PathBuf,
    remote: String,
    push: bool,
    github: Option<Arc<GitHubClient>>,
}

impl GitVcs {
    /// Create a collaborator for the repository at `repo_path`.
    pub fn new(
        repo_path: PathBuf,
        remote: String,
        push: bool,
        github: Option<GitHubClient>,
    ) -> Self {
        Self {
            repo_path,
            remote,
            push,
            github: github.map(Arc::new),
        }
    }

    async fn with_repo<T, F>(&self, op: F) -> ForemanResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> ForemanResult<T> + Send + 'static,
    {
        let path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)
                .map_err(|e| vcs_err(&format!("cannot open repository {}", path.display()), e))?;
            op(&repo)
        })
        .await
        .map_err(|e| ForemanError::Vcs(format!("git worker failed: {e}")))?
    }
}

/// Path relative to the repository work tree.
fn relative_to_workdir(repo: &Repository, path: &Path) -> ForemanResult<PathBuf> {
    if path.is_relative() {
        return Ok(path.to_path_buf());
    }
    let workdir = repo
        .workdir()
        .ok_or_else(|| ForemanError::Vcs("repository has no work tree".into()))?;
    let canonical_workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
    let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    canonical_path
        .strip_prefix(&canonical_workdir)
        .map(Path::to_path_buf)
        .map_err(|_| {
            ForemanError::Vcs(format!(
                "{} is outside the repository work tree",
                path.display()
            ))
        })
}

fn signature(repo: &Repository) -> ForemanResult<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Signature::now("foreman", "foreman@localhost")
            .map_err(|e| vcs_err("cannot build commit signature", e)),
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    fn name(&self) -> &str {
        "git"
    }

    async fn create_branch(&self, change: &ChangeRequest) -> ForemanResult<()> {
        let branch = change.branch.clone();
        self.with_repo(move |repo| {
            let exists = repo.find_branch(&branch, BranchType::Local).is_ok();
            if !exists {
                let head = repo
                    .head()
                    .and_then(|h| h.peel_to_commit())
                    .map_err(|e| vcs_err("cannot resolve HEAD", e))?;
                repo.branch(&branch, &head, false)
                    .map_err(|e| vcs_err(&format!("cannot create branch {branch}"), e))?;
            }
            repo.set_head(&format!("refs/heads/{branch}"))
                .map_err(|e| vcs_err(&format!("cannot switch to {branch}"), e))?;
            tracing::info!(branch = %branch, created = !exists, "Git: on task branch");
            Ok(())
        })
        .await
    }

    async fn commit_changes(
        &self,
        change: &ChangeRequest,
        paths: &[PathBuf],
        message: &str,
    ) -> ForemanResult<String> {
        let paths = paths.to_vec();
        let message = message.to_string();
        let task_id = change.task_id.clone();
        self.with_repo(move |repo| {
            let mut index = repo.index().map_err(|e| vcs_err("cannot open index", e))?;
            for path in &paths {
                let relative = relative_to_workdir(repo, path)?;
                index
                    .add_path(&relative)
                    .map_err(|e| vcs_err(&format!("cannot stage {}", relative.display()), e))?;
            }
            index.write().map_err(|e| vcs_err("cannot write index", e))?;
            let tree_id = index
                .write_tree()
                .map_err(|e| vcs_err("cannot write tree", e))?;
            let tree = repo
                .find_tree(tree_id)
                .map_err(|e| vcs_err("cannot load tree", e))?;

            let parent = match repo.head() {
                Ok(head) => Some(
                    head.peel_to_commit()
                        .map_err(|e| vcs_err("cannot resolve HEAD", e))?,
                ),
                Err(_) => None,
            };
            let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

            let sig = signature(repo)?;
            let oid = repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)
                .map_err(|e| vcs_err("cannot create commit", e))?;
            tracing::info!(task_id = %task_id, commit = %oid, files = paths.len(), "Git: committed");
            Ok(oid.to_string())
        })
        .await
    }

    async fn push_branch(&self, branch: &str) -> ForemanResult<()> {
        if !self.push {
            tracing::info!(branch, "Git: push disabled, skipping");
            return Ok(());
        }
        let branch = branch.to_string();
        let remote_name = self.remote.clone();
        self.with_repo(move |repo| {
            let mut remote = repo
                .find_remote(&remote_name)
                .map_err(|e| vcs_err(&format!("unknown remote {remote_name}"), e))?;
            let config = repo.config().map_err(|e| vcs_err("cannot read git config", e))?;

            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(move |url, username, allowed| {
                if allowed.is_ssh_key() {
                    if let Some(user) = username {
                        return Cred::ssh_key_from_agent(user);
                    }
                }
                Cred::credential_helper(&config, url, username)
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| vcs_err(&format!("push of {branch} failed"), e))?;
            tracing::info!(branch = %branch, remote = %remote_name, "Git: pushed");
            Ok(())
        })
        .await
    }

    async fn create_pr(&self, change: &ChangeRequest) -> ForemanResult<PullRequestRef> {
        let github = self.github.as_ref().ok_or_else(|| {
            ForemanError::Vcs("no GitHub client configured, cannot open pull requests".into())
        })?;
        github.create_pull_request(change).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let sig = Signature::now("test", "test@example.com").unwrap();
            std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        (dir, repo)
    }

    #[tokio::test]
    async fn test_branch_and_commit() {
        let (dir, repo) = init_repo();
        let vcs = GitVcs::new(dir.path().to_path_buf(), "origin".into(), false, None);
        let change = ChangeRequest::new("T1", "Add login", "body", "main");

        vcs.create_branch(&change).await.unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/login.rs"), "pub fn login() {}\n").unwrap();

        let commit = vcs
            .commit_changes(&change, &[PathBuf::from("src/login.rs")], "T1: Add login")
            .await
            .unwrap();

        let head = repo.head().unwrap();
        assert_eq!(head.shorthand(), Some("foreman/t1-add-login"));
        let head_commit = head.peel_to_commit().unwrap();
        assert_eq!(head_commit.id().to_string(), commit);
        assert_eq!(head_commit.message(), Some("T1: Add login"));
        assert!(head_commit
            .tree()
            .unwrap()
            .get_path(Path::new("src/login.rs"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_create_branch_is_idempotent() {
        let (dir, _repo) = init_repo();
        let vcs = GitVcs::new(dir.path().to_path_buf(), "origin".into(), false, None);
        let change = ChangeRequest::new("T2", "Docs", "", "main");
        vcs.create_branch(&change).await.unwrap();
        vcs.create_branch(&change).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_disabled_and_missing_github() {
        let (dir, _repo) = init_repo();
        let vcs = GitVcs::new(dir.path().to_path_buf(), "origin".into(), false, None);
        vcs.push_branch("foreman/t1").await.unwrap();

        let change = ChangeRequest::new("T1", "x", "", "main");
        let err = vcs.create_pr(&change).await.unwrap_err();
        assert!(matches!(err, ForemanError::Vcs(_)));
    }

    #[tokio::test]
    async fn test_push_to_unknown_remote_is_vcs_error() {
        let (dir, _repo) = init_repo();
        let vcs = GitVcs::new(dir.path().to_path_buf(), "nowhere".into(), true, None);
        let err = vcs.push_branch("master").await.unwrap_err();
        assert!(matches!(err, ForemanError::Vcs(_)));
    }

    #[tokio::test]
    async fn test_open_missing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = GitVcs::new(dir.path().join("nope"), "origin".into(), false, None);
        let change = ChangeRequest::new("T1", "x", "", "main");
        assert!(vcs.create_branch(&change).await.is_err());
    }
}
