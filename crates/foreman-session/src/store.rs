use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const ENVELOPE_FORMAT: u32 = 1;
const SNAPSHOT_FILE: &str = "snapshot.json";
const REPORT_FILE: &str = "report.json";

/// A fresh run identifier: UTC timestamp plus a short random suffix, so
/// directory listings sort chronologically.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// On-disk wrapper carrying the payload checksum.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: u32,
    kind: String,
    run_id: String,
    saved_at: DateTime<Utc>,
    sha256: String,
    payload: serde_json::Value,
}

fn checksum(payload: &serde_json::Value) -> ForemanResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// File-based store for run snapshots and reports.
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    /// Open (and create) `<data_dir>/runs`.
    pub async fn new(data_dir: impl AsRef<Path>) -> ForemanResult<Self> {
        let runs_dir = data_dir.as_ref().join("runs");
        tokio::fs::create_dir_all(&runs_dir).await?;
        Ok(Self { runs_dir })
    }

    /// Directory holding everything for `run_id`.
    pub fn run_dir(&self, run_id: &str) -> ForemanResult<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.runs_dir.join(run_id))
    }

    /// Persist the task-graph snapshot of a run, replacing any previous one.
    pub async fn save_snapshot<T: Serialize>(&self, run_id: &str, snapshot: &T) -> ForemanResult<()> {
        self.write(run_id, SNAPSHOT_FILE, "snapshot", snapshot).await
    }

    /// Load the snapshot of a run, `None` if none was saved.
    pub async fn load_snapshot<T: DeserializeOwned>(&self, run_id: &str) -> ForemanResult<Option<T>> {
        self.read(run_id, SNAPSHOT_FILE, "snapshot").await
    }

    /// Persist the terminal report of a run.
    pub async fn save_report<T: Serialize>(&self, run_id: &str, report: &T) -> ForemanResult<()> {
        self.write(run_id, REPORT_FILE, "report", report).await
    }

    /// Load the terminal report of a run, `None` if the run has none.
    pub async fn load_report<T: DeserializeOwned>(&self, run_id: &str) -> ForemanResult<Option<T>> {
        self.read(run_id, REPORT_FILE, "report").await
    }

    /// Identifiers of every run with a directory, oldest first.
    pub async fn list_runs(&self) -> ForemanResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// The most recent run, by identifier order.
    pub async fn latest_run(&self) -> ForemanResult<Option<String>> {
        Ok(self.list_runs().await?.pop())
    }

    async fn write<T: Serialize>(
        &self,
        run_id: &str,
        file: &str,
        kind: &str,
        value: &T,
    ) -> ForemanResult<()> {
        let dir = self.run_dir(run_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let payload = serde_json::to_value(value)?;
        let envelope = Envelope {
            format: ENVELOPE_FORMAT,
            kind: kind.to_string(),
            run_id: run_id.to_string(),
            saved_at: Utc::now(),
            sha256: checksum(&payload)?,
            payload,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        // Write-then-rename keeps the previous file intact if we die mid-write.
        let target = dir.join(file);
        let tmp = dir.join(format!("{file}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        tracing::debug!(run_id, kind, path = %target.display(), "Run state saved");
        Ok(())
    }

    async fn read<T: DeserializeOwned>(
        &self,
        run_id: &str,
        file: &str,
        kind: &str,
    ) -> ForemanResult<Option<T>> {
        let path = self.run_dir(run_id)?.join(file);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let envelope: Envelope = serde_json::from_str(&data).map_err(|e| {
            ForemanError::Corruption(format!("{} is not a valid {kind} file: {e}", path.display()))
        })?;

        if envelope.format != ENVELOPE_FORMAT {
            return Err(ForemanError::Session(format!(
                "{} uses unsupported format {}",
                path.display(),
                envelope.format
            )));
        }
        if envelope.kind != kind || envelope.run_id != run_id {
            return Err(ForemanError::Corruption(format!(
                "{} holds {} for run {}, expected {kind} for run {run_id}",
                path.display(),
                envelope.kind,
                envelope.run_id
            )));
        }
        let actual = checksum(&envelope.payload)?;
        if actual != envelope.sha256 {
            tracing::error!(run_id, kind, expected = %envelope.sha256, actual = %actual, "Checksum mismatch");
            return Err(ForemanError::Corruption(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }

        let value = serde_json::from_value(envelope.payload).map_err(|e| {
            ForemanError::Session(format!("failed to parse {kind} of run {run_id}: {e}"))
        })?;
        Ok(Some(value))
    }
}

/// Run identifiers become directory names: no separators, no dot-only names.
fn validate_run_id(run_id: &str) -> ForemanResult<()> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ForemanError::Security(format!("invalid run id '{run_id}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snap {
        tasks: Vec<String>,
        iterations: u32,
    }

    fn snap() -> Snap {
        Snap {
            tasks: vec!["T1".into(), "T2".into()],
            iterations: 2,
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path()).await.unwrap();
        store.save_snapshot("run-1", &snap()).await.unwrap();
        let loaded: Snap = store.load_snapshot("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, snap());
        assert!(store.run_dir("run-1").unwrap().join("snapshot.json").exists());
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path()).await.unwrap();
        let loaded: Option<Snap> = store.load_report("nope").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_tampered_payload_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path()).await.unwrap();
        store.save_snapshot("run-1", &snap()).await.unwrap();

        let path = store.run_dir("run-1").unwrap().join("snapshot.json");
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"iterations\": 2", "\"iterations\": 3")).unwrap();

        let err = store.load_snapshot::<Snap>("run-1").await.unwrap_err();
        assert!(matches!(err, ForemanError::Corruption(_)));
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_garbage_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path()).await.unwrap();
        let run_dir = store.run_dir("run-1").unwrap();
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("report.json"), "{not json").unwrap();
        let err = store.load_report::<Snap>("run-1").await.unwrap_err();
        assert!(matches!(err, ForemanError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_list_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path()).await.unwrap();
        store.save_report("20240101-000000-aaaa", &snap()).await.unwrap();
        store.save_report("20240102-000000-bbbb", &snap()).await.unwrap();
        assert_eq!(store.list_runs().await.unwrap().len(), 2);
        assert_eq!(
            store.latest_run().await.unwrap().as_deref(),
            Some("20240102-000000-bbbb")
        );
    }

    #[test]
    fn test_run_id_validation() {
        assert!(validate_run_id("20240101-000000-abcd1234").is_ok());
        assert!(validate_run_id("../etc").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("..").is_err());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id(&new_run_id()).is_ok());
    }
}
