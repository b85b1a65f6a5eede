use super::{Backend, ExecutionOutput, FILE_BLOCK_INSTRUCTIONS};
use crate::config::BackendConfig;
use crate::files::{parse_file_blocks, write_files};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use std::path::Path;
use std::time::Duration;

/// Claude Code CLI backend.
///
/// Runs the `claude` CLI in headless mode (`-p --output-format json`) inside
/// the output directory and writes the file blocks of its answer there.
/// Uses the operator's existing Claude Code session, no API key needed.
pub struct ClaudeCodeBackend {
    config: BackendConfig,
}

impl ClaudeCodeBackend {
    /// Create a backend from its configuration entry.
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> &str {
        self.config.program.as_deref().unwrap_or("claude")
    }
}

/// Text and token usage extracted from the CLI's JSON result line.
#[derive(Debug, PartialEq)]
pub(crate) struct CliResult {
    pub text: String,
    pub tokens_used: u64,
}

/// Parse the last JSON line printed by `claude -p --output-format json`.
pub(crate) fn parse_cli_result(stdout: &str) -> ForemanResult<CliResult> {
    let result_json: serde_json::Value = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| {
            let preview: String = stdout.chars().take(500).collect();
            ForemanError::Execution(format!(
                "Could not parse Claude Code output as JSON. stdout: {preview}"
            ))
        })?;

    let is_error = result_json["is_error"].as_bool().unwrap_or(false);
    let text = result_json["result"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    if is_error {
        return Err(ForemanError::Execution(format!("Claude Code error: {text}")));
    }

    let input_tokens = result_json["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = result_json["usage"]["output_tokens"].as_u64().unwrap_or(0);
    if let Some(cost) = result_json["total_cost_usd"].as_f64() {
        tracing::info!(
            cost_usd = cost,
            input_tokens,
            output_tokens,
            num_turns = result_json["num_turns"].as_u64().unwrap_or(0),
            "ClaudeCode: response received"
        );
    }

    Ok(CliResult {
        text,
        tokens_used: input_tokens + output_tokens,
    })
}

#[async_trait]
impl Backend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn execute(
        &self,
        task_description: &str,
        output_dir: &Path,
    ) -> ForemanResult<ExecutionOutput> {
        if task_description.trim().is_empty() {
            return Err(ForemanError::Execution(
                "empty task description for ClaudeCode backend".into(),
            ));
        }
        tokio::fs::create_dir_all(output_dir).await?;

        let prompt = format!("{task_description}\n\n{FILE_BLOCK_INSTRUCTIONS}");
        let mut cmd = tokio::process::Command::new(self.program());
        cmd.arg("-p").arg(&prompt);
        cmd.arg("--output-format").arg("json");
        cmd.arg("--max-turns").arg(self.config.max_turns.to_string());

        if let Some(model) = self.config.model.as_deref().filter(|m| *m != "default") {
            cmd.arg("--model").arg(model);
        }

        cmd.arg("--permission-mode").arg("plan");
        cmd.arg("--no-session-persistence");
        cmd.current_dir(output_dir);
        cmd.kill_on_drop(true);

        tracing::info!(prompt_len = prompt.len(), "ClaudeCode: spawning claude CLI");

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                ForemanError::Execution(format!(
                    "claude CLI timed out after {}s",
                    self.config.timeout_secs
                ))
            })?
            .map_err(|e| {
                ForemanError::Execution(format!(
                    "Failed to run 'claude' CLI. Is Claude Code installed? Error: {e}"
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ForemanError::Execution(format!(
                "Claude Code CLI failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        let result = parse_cli_result(&stdout)?;
        let files = parse_file_blocks(&result.text)?;
        write_files(output_dir, &files).await?;

        Ok(ExecutionOutput {
            files,
            tokens_used: result.tokens_used,
            summary: result.text,
        })
    }

    async fn health_check(&self) -> bool {
        let mut cmd = tokio::process::Command::new(self.program());
        cmd.arg("--version");
        match cmd.output().await {
            Ok(out) => out.status.success(),
            Err(e) => {
                tracing::warn!(error = %e, "ClaudeCode: health check failed");
                false
            }
        }
    }
}
