use super::{estimate_tokens, Backend, ExecutionOutput, FILE_BLOCK_INSTRUCTIONS};
use crate::config::BackendConfig;
use crate::files::{parse_file_blocks, write_files};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the full prompt in configured arguments.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";
/// Placeholder replaced by the output directory in configured arguments.
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";

/// Backend that shells out to any code-generation CLI.
///
/// The configured arguments may contain `{prompt}` and `{output_dir}`; when
/// no argument mentions `{prompt}` the prompt is passed as the last argument.
/// File blocks in the command's stdout are written to the output directory.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    /// Build from configuration. Fails when no program is configured.
    pub fn new(config: &BackendConfig) -> ForemanResult<Self> {
        let program = config
            .program
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                ForemanError::Config("command backend requires a 'program'".into())
            })?;
        Ok(Self {
            program,
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn render_args(&self, prompt: &str, output_dir: &Path) -> Vec<String> {
        let dir = output_dir.display().to_string();
        let mut rendered: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace(PROMPT_PLACEHOLDER, prompt)
                    .replace(OUTPUT_DIR_PLACEHOLDER, &dir)
            })
            .collect();
        if !self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER)) {
            rendered.push(prompt.to_string());
        }
        rendered
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(
        &self,
        task_description: &str,
        output_dir: &Path,
    ) -> ForemanResult<ExecutionOutput> {
        tokio::fs::create_dir_all(output_dir).await?;
        let prompt = format!("{task_description}\n\n{FILE_BLOCK_INSTRUCTIONS}");

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.render_args(&prompt, output_dir));
        cmd.current_dir(output_dir);
        cmd.kill_on_drop(true);

        tracing::info!(program = %self.program, prompt_len = prompt.len(), "Command backend: spawning");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ForemanError::Execution(format!(
                    "'{}' timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ForemanError::Execution(format!("failed to run '{}': {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Execution(format!(
                "'{}' failed (exit {}): {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let files = parse_file_blocks(&stdout)?;
        write_files(output_dir, &files).await?;
        Ok(ExecutionOutput {
            tokens_used: estimate_tokens(&prompt) + estimate_tokens(&stdout),
            files,
            summary: stdout.trim().chars().take(2000).collect(),
        })
    }

    async fn health_check(&self) -> bool {
        find_program(&self.program).is_some()
    }
}

/// Resolve a program name against `PATH`, or check it directly when it
/// contains a path separator.
fn find_program(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
