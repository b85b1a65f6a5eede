#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_core::ForemanError;
use foreman_session::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Report {
    reason: String,
    completed: Vec<String>,
}

// ---------------------------------------------------------------------------
// 1. Snapshot, report and events share one run directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_directory_holds_all_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = RunStore::new(dir.path()).await.unwrap();
    let run_id = new_run_id();

    let log = EventLog::open(store.run_dir(&run_id).unwrap(), &run_id)
        .await
        .unwrap();
    log.log(RunEvent::RunStarted { tasks: 1 });
    log.log(RunEvent::Halt {
        reason: "TOKEN_LIMIT".into(),
        detail: "1000000 of 1000000 tokens used".into(),
    });
    log.flush().await.unwrap();

    let report = Report {
        reason: "TOKEN_LIMIT".into(),
        completed: vec!["T1".into()],
    };
    store.save_report(&run_id, &report).await.unwrap();
    store
        .save_snapshot(&run_id, &serde_json::json!({"tasks": []}))
        .await
        .unwrap();

    let run_dir = store.run_dir(&run_id).unwrap();
    for file in ["events.jsonl", "report.json", "snapshot.json"] {
        assert!(run_dir.join(file).exists(), "{file} missing");
    }
    assert_eq!(store.load_report::<Report>(&run_id).await.unwrap(), Some(report));
    assert_eq!(read_events(log.path()).await.unwrap().len(), 2);
    assert_eq!(store.latest_run().await.unwrap(), Some(run_id));
}

// ---------------------------------------------------------------------------
// 2. A report saved for one run cannot be passed off as another's
// ---------------------------------------------------------------------------

#[tokio::test]
async fn copied_file_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let store = RunStore::new(dir.path()).await.unwrap();
    let report = Report {
        reason: "ALL_TASKS_DONE".into(),
        completed: vec![],
    };
    store.save_report("run-a", &report).await.unwrap();
    store.save_report("run-b", &report).await.unwrap();

    let a = store.run_dir("run-a").unwrap().join("report.json");
    let b = store.run_dir("run-b").unwrap().join("report.json");
    std::fs::copy(&a, &b).unwrap();

    let err = store.load_report::<Report>("run-b").await.unwrap_err();
    assert!(matches!(err, ForemanError::Corruption(_)));
}

// ---------------------------------------------------------------------------
// 3. Path-like run ids are refused
// ---------------------------------------------------------------------------

#[tokio::test]
async fn traversal_run_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = RunStore::new(dir.path()).await.unwrap();
    let err = store
        .save_report("../outside", &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.is_critical());
}
