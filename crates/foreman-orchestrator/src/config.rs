use crate::priority::PriorityWeights;
use crate::review::ReviewConfig;
use crate::stopping::StopThresholds;
use foreman_agent::{BackendConfig, RetryPolicy, VcsConfig};
use foreman_core::intervention::InterventionAction;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of `foreman.toml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Where run state is persisted.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory backends write generated files into.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Scheduling and timing.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Priority weights.
    #[serde(default)]
    pub priority: PriorityWeights,
    /// Review weights, threshold and iteration limit.
    #[serde(default)]
    pub review: ReviewConfig,
    /// Stopping thresholds.
    #[serde(default)]
    pub limits: StopThresholds,
    /// Operator decisions.
    #[serde(default)]
    pub intervention: InterventionSettings,
    /// Overrides `backend.retry` when present.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Optional improvement phase after full completion.
    #[serde(default)]
    pub improvement: ImprovementSettings,
    /// Code-generation backend.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Version control.
    #[serde(default)]
    pub vcs: VcsConfig,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Concurrent task slots; 1 runs sequentially.
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Fallback wake-up of the scheduling loop, in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Health sampling interval, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// How long an executor waits for a review verdict.
    #[serde(default = "default_review_timeout_secs")]
    pub review_timeout_secs: u64,
}

/// `[intervention]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionSettings {
    /// Deadline for an operator answer.
    #[serde(default = "default_intervention_timeout_secs")]
    pub timeout_secs: u64,
    /// Action applied when no answer arrives in time.
    #[serde(default = "default_action")]
    pub default_action: InterventionAction,
    /// Operator retries allowed per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// `[improvement]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovementSettings {
    /// Run improvement cycles once every task completed.
    #[serde(default)]
    pub enabled: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".foreman")
}
fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_slots() -> usize {
    1
}
fn default_tick_ms() -> u64 {
    250
}
fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_review_timeout_secs() -> u64 {
    900
}
fn default_intervention_timeout_secs() -> u64 {
    300
}
fn default_action() -> InterventionAction {
    InterventionAction::Skip
}
fn default_max_retries() -> u32 {
    3
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            tick_ms: default_tick_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            review_timeout_secs: default_review_timeout_secs(),
        }
    }
}

impl Default for InterventionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_intervention_timeout_secs(),
            default_action: default_action(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workspace_dir: default_workspace_dir(),
            orchestrator: OrchestratorSettings::default(),
            priority: PriorityWeights::default(),
            review: ReviewConfig::default(),
            limits: StopThresholds::default(),
            intervention: InterventionSettings::default(),
            retry: None,
            improvement: ImprovementSettings::default(),
            backend: BackendConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

impl ForemanConfig {
    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> ForemanResult<Self> {
        let mut config: ForemanConfig = toml::from_str(text)
            .map_err(|e| ForemanError::Config(format!("invalid configuration: {e}")))?;
        if let Some(retry) = config.retry.clone() {
            config.backend.retry = retry;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults when no path is given or the file does
    /// not exist.
    pub async fn load(path: Option<&Path>) -> ForemanResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !tokio::fs::try_exists(path).await? {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&text)?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ForemanResult<()> {
        self.review.weights.validate()?;
        if self.orchestrator.slots == 0 {
            return Err(ForemanError::Config("orchestrator.slots must be at least 1".into()));
        }
        if self.orchestrator.tick_ms == 0 {
            return Err(ForemanError::Config("orchestrator.tick_ms must be at least 1".into()));
        }
        if self.orchestrator.sample_interval_ms == 0 {
            return Err(ForemanError::Config(
                "orchestrator.sample_interval_ms must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.review.approval_threshold) {
            return Err(ForemanError::Config(format!(
                "review.approval_threshold must be within 0..=100, got {}",
                self.review.approval_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_agent::{BackendKind, VcsKind};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ForemanConfig::parse("").unwrap();
        assert_eq!(config, ForemanConfig::default());
        assert_eq!(config.orchestrator.slots, 1);
        assert_eq!(config.review.approval_threshold, 80.0);
        assert_eq!(config.review.max_iterations, 3);
        assert_eq!(config.limits.token_limit, 1_000_000);
        assert_eq!(config.intervention.default_action, InterventionAction::Skip);
        assert_eq!(config.backend.kind, BackendKind::DryRun);
    }

    #[test]
    fn test_full_config() {
        let config = ForemanConfig::parse(
            r#"
data_dir = "/var/lib/foreman"

[orchestrator]
slots = 4

[priority]
setup = 70.0

[review]
approval_threshold = 85.0

[review.weights]
code_quality = 40
testing = 30
documentation = 15
acceptance = 15

[limits]
token_limit = 500000
stagnation_minutes = 10.0

[intervention]
timeout_secs = 60
default_action = "halt"

[retry]
max_retries = 5

[backend]
kind = "command"
program = "aider"
args = ["--message", "{prompt}"]

[[backend.fallbacks]]
kind = "dry-run"

[vcs]
kind = "git"
push = false
"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.slots, 4);
        assert_eq!(config.priority.setup, 70.0);
        assert_eq!(config.priority.bugfix, 40.0);
        assert_eq!(config.review.weights.code_quality, 40);
        assert_eq!(config.limits.token_limit, 500_000);
        assert_eq!(config.limits.context_limit, 200_000);
        assert_eq!(config.intervention.default_action, InterventionAction::Halt);
        assert_eq!(config.backend.retry.max_retries, 5);
        assert_eq!(config.backend.fallbacks.len(), 1);
        assert_eq!(config.vcs.kind, VcsKind::Git);
        assert!(!config.vcs.push);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let err = ForemanConfig::parse("[review.weights]\ncode_quality = 90\n").unwrap_err();
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn test_zero_slots_rejected() {
        assert!(ForemanConfig::parse("[orchestrator]\nslots = 0\n").is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let err = ForemanConfig::parse("[orchestrator]\ntick_ms = 0\n").unwrap_err();
        assert!(matches!(err, ForemanError::Config(ref m) if m.contains("tick_ms")));
        let err = ForemanConfig::parse("[orchestrator]\nsample_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ForemanError::Config(ref m) if m.contains("sample_interval_ms")));

        let mut config = ForemanConfig::default();
        config.orchestrator.tick_ms = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForemanConfig::load(Some(&dir.path().join("foreman.toml")))
            .await
            .unwrap();
        assert_eq!(config, ForemanConfig::default());
        assert_eq!(ForemanConfig::load(None).await.unwrap(), ForemanConfig::default());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "[orchestrator]\nslots = 2\n").unwrap();
        let config = ForemanConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.orchestrator.slots, 2);
    }
}
