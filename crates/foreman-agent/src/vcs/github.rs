use super::{ChangeRequest, PullRequestRef};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The `[vcs.github]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// API root, overridable for GitHub Enterprise.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Environment variable holding the token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_api_url() -> String {
    "https://api.github.com".into()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}

#[derive(Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PullRequestResponse {
    html_url: String,
    number: u64,
}

/// Minimal GitHub REST client: opens pull requests.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl GitHubClient {
    /// Create a client for `owner/repo` at `api_url`.
    pub fn new(
        api_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
    ) -> ForemanResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("foreman/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForemanError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
        })
    }

    /// Create a client from configuration, reading the token from the
    /// configured environment variable.
    pub fn from_config(config: &GitHubConfig) -> ForemanResult<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            ForemanError::Config(format!(
                "GitHub token variable '{}' is not set",
                config.token_env
            ))
        })?;
        Self::new(&config.api_url, &config.owner, &config.repo, token)
    }

    /// `POST /repos/{owner}/{repo}/pulls`.
    ///
    /// 429 and 5xx responses surface as transient `Http` errors; anything
    /// else unsuccessful is a `Vcs` error.
    pub async fn create_pull_request(
        &self,
        change: &ChangeRequest,
    ) -> ForemanResult<PullRequestRef> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_url, self.owner, self.repo);
        let body = CreatePullRequest {
            title: &change.title,
            head: &change.branch,
            base: &change.base_branch,
            body: &change.body,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForemanError::Http(format!("GitHub request timeout: {e}"))
                } else {
                    ForemanError::Http(format!("GitHub request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ForemanError::Http(format!(
                    "GitHub returned {}: {text}",
                    status.as_u16()
                )));
            }
            return Err(ForemanError::Vcs(format!(
                "GitHub rejected pull request for '{}' ({}): {text}",
                change.branch,
                status.as_u16()
            )));
        }

        let created: PullRequestResponse = response
            .json()
            .await
            .map_err(|e| ForemanError::Vcs(format!("unexpected GitHub response: {e}")))?;
        tracing::info!(
            task_id = %change.task_id,
            number = created.number,
            url = %created.html_url,
            "Pull request opened"
        );
        Ok(PullRequestRef {
            url: created.html_url,
            number: created.number,
        })
    }
}
