use foreman_core::{ForemanError, ForemanResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Fenced block whose info string names a file path, optionally after a
/// language tag: "```rust src/lib.rs", "```src/lib.rs" or "```rust path=src/lib.rs".
const FILE_BLOCK_PATTERN: &str =
    r"(?ms)^```[ \t]*(?:[A-Za-z0-9_+-]+[ \t]+)?(?:path=)?([\w./-]+\.\w+)[ \t]*\r?\n(.*?)^```[ \t]*$";

/// Extract `path -> content` pairs from fenced code blocks in backend output.
///
/// Blocks without a path (plain "```rust") are ignored. A path appearing
/// twice keeps the last block.
pub fn parse_file_blocks(text: &str) -> ForemanResult<BTreeMap<String, String>> {
    let re = Regex::new(FILE_BLOCK_PATTERN)
        .map_err(|e| ForemanError::Execution(format!("invalid file block pattern: {e}")))?;

    let mut files = BTreeMap::new();
    for caps in re.captures_iter(text) {
        let (Some(path), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let path = path.as_str().trim_start_matches("./").to_string();
        validate_relative_path(&path)?;
        files.insert(path, body.as_str().to_string());
    }
    Ok(files)
}

/// Reject absolute paths and parent-directory components.
///
/// Generated files must land inside the output directory; anything else is a
/// security failure and halts the run.
pub fn validate_relative_path(path: &str) -> ForemanResult<()> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(ForemanError::Security(format!(
            "generated file path '{path}' is not relative to the output directory"
        )));
    }
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ForemanError::Security(format!(
            "generated file path '{path}' escapes the output directory"
        )));
    }
    Ok(())
}

/// Write generated files under `output_dir`, creating parent directories.
///
/// Returns the absolute paths written, in path order.
pub async fn write_files(
    output_dir: &Path,
    files: &BTreeMap<String, String>,
) -> ForemanResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(files.len());
    for (relative, content) in files {
        validate_relative_path(relative)?;
        let target = output_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        written.push(target);
    }
    Ok(written)
}
