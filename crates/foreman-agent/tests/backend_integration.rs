#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_agent::vcs::{GitVcs, LocalVcs, VcsOperation};
use foreman_agent::*;
use std::path::{Path, PathBuf};

fn init_repo(dir: &Path) -> git2::Repository {
    let repo = git2::Repository::init(dir).unwrap();
    {
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let mut index = repo.index().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "empty", &tree, &[])
            .unwrap();
    }
    repo
}

// ---------------------------------------------------------------------------
// 1. The default configuration runs offline end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_backend_generates_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = build_backend(&BackendConfig::default()).unwrap();
    assert!(backend.health_check().await);

    let output = backend
        .execute("Implement rate limiter\n\n- token bucket", dir.path())
        .await
        .unwrap();
    assert!(output.files.contains_key("src/implement_rate_limiter.rs"));
    for path in output.files.keys() {
        assert!(dir.path().join(path).exists(), "{path} not written");
    }
}

// ---------------------------------------------------------------------------
// 2. Generated files flow into a real git commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generated_files_are_committed_on_task_branch() {
    let dir = tempfile::tempdir().unwrap();
    let repo = init_repo(dir.path());

    let backend = build_backend(&BackendConfig::of_kind(BackendKind::DryRun)).unwrap();
    let output = backend.execute("Parse settings", dir.path()).await.unwrap();

    let vcs = GitVcs::new(dir.path().to_path_buf(), "origin".into(), false, None);
    let change = ChangeRequest::new("T7", "Parse settings", "", "main");
    vcs.create_branch(&change).await.unwrap();

    let absolute: Vec<PathBuf> = output.files.keys().map(|p| dir.path().join(p)).collect();
    vcs.commit_changes(&change, &absolute, &change.commit_message(1))
        .await
        .unwrap();

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    let tree = head.tree().unwrap();
    for path in output.files.keys() {
        assert!(tree.get_path(Path::new(path)).is_ok(), "{path} missing from commit");
    }
    assert_eq!(head.message(), Some("T7: Parse settings"));
}

// ---------------------------------------------------------------------------
// 3. VCS selection from TOML
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vcs_selected_by_configuration() {
    let config: VcsConfig = toml::from_str("kind = \"local\"").unwrap();
    let vcs = build_vcs(&config, Path::new(".")).unwrap();
    let change = ChangeRequest::new("T1", "Login", "", "main");
    vcs.create_branch(&change).await.unwrap();
    let pr = vcs.create_pr(&change).await.unwrap();
    assert!(pr.url.starts_with("local://"));

    let local = LocalVcs::new();
    local.push_branch("foreman/t1-login").await.unwrap();
    assert_eq!(
        local.operations().await,
        vec![VcsOperation::Push {
            branch: "foreman/t1-login".into()
        }]
    );
}

// ---------------------------------------------------------------------------
// 4. A GitHub section needs its token variable
// ---------------------------------------------------------------------------

#[test]
fn github_section_requires_token() {
    let config: VcsConfig = toml::from_str(
        r#"
kind = "git"

[github]
owner = "acme"
repo = "widgets"
token_env = "FOREMAN_INTEGRATION_TOKEN_UNSET"
"#,
    )
    .unwrap();
    assert!(build_vcs(&config, Path::new(".")).is_err());
}
