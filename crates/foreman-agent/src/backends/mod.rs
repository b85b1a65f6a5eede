/// Claude Code CLI backend.
pub mod claude_code;
/// Generic command-line backend.
pub mod command;
/// Deterministic offline backend.
pub mod dry_run;

pub use claude_code::ClaudeCodeBackend;
pub use command::CommandBackend;
pub use dry_run::DryRunBackend;

use async_trait::async_trait;
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// What a backend produced for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Generated files, relative path to content.
    pub files: BTreeMap<String, String>,
    /// Tokens consumed by the call (reported or estimated).
    pub tokens_used: u64,
    /// Free-text summary returned alongside the files.
    #[serde(default)]
    pub summary: String,
}

impl ExecutionOutput {
    /// Relative paths of the generated files, in path order.
    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// Trait for code-generation backends.
///
/// A backend is a black box: it receives the full task description (including
/// acceptance criteria and review feedback) and an output directory, writes
/// the generated files there and returns them.
///
/// To add a new backend:
/// 1. Create a new module in `backends/`
/// 2. Implement `Backend` for your struct
/// 3. Add the variant to `BackendKind` in `config.rs`
/// 4. Wire it up in `build_backend()`
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Generate the files for `task_description` under `output_dir`.
    async fn execute(
        &self,
        task_description: &str,
        output_dir: &Path,
    ) -> ForemanResult<ExecutionOutput>;

    /// Whether the backend is reachable and usable.
    async fn health_check(&self) -> bool;
}

/// Rough token estimate for backends that do not report usage.
pub(crate) fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Instructions appended to every prompt so file blocks can be parsed back.
pub(crate) const FILE_BLOCK_INSTRUCTIONS: &str = "Return every file you create or change as a fenced code block whose info string is the language followed by the file path relative to the repository root, for example:\n```rust src/lib.rs\n// contents\n```";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn test_output_paths() {
        let mut output = ExecutionOutput::default();
        output.files.insert("b.rs".into(), String::new());
        output.files.insert("a.rs".into(), String::new());
        assert_eq!(output.paths(), vec!["a.rs".to_string(), "b.rs".to_string()]);
    }
}
