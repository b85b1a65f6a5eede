use chrono::{DateTime, Utc};
use foreman_bus::{Message, MessageSink};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const EVENTS_FILE: &str = "events.jsonl";

/// Something worth remembering about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run began with this many tasks.
    RunStarted {
        /// Number of planned tasks.
        tasks: usize,
    },
    /// A message went over the bus.
    Message {
        /// The message as sent.
        message: Message,
    },
    /// A task changed status.
    TaskTransition {
        /// Task identifier.
        task_id: String,
        /// Previous status label.
        from: String,
        /// New status label.
        to: String,
    },
    /// An operator decision was requested and resolved.
    Intervention {
        /// Task the decision was about.
        task_id: String,
        /// Chosen action.
        action: String,
        /// Who decided (operator, timeout, unavailable).
        source: String,
    },
    /// The stopping evaluator or an error halted the run.
    Halt {
        /// Halt reason label.
        reason: String,
        /// Human-readable detail.
        detail: String,
    },
    /// The run ended.
    RunFinished {
        /// Final reason label.
        reason: String,
        /// Process exit code the reason maps to.
        exit_code: i32,
    },
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event was logged.
    pub timestamp: DateTime<Utc>,
    /// Run the event belongs to.
    pub run_id: String,
    /// The event itself.
    pub event: RunEvent,
}

enum Command {
    Append(EventRecord),
    Flush(oneshot::Sender<()>),
}

/// Append-only event log for one run.
///
/// Logging never blocks: records go through a channel to a background task
/// that owns the file. [`EventLog::flush`] waits until everything logged so
/// far is on disk.
#[derive(Clone)]
pub struct EventLog {
    run_id: String,
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl EventLog {
    /// Open `<run_dir>/events.jsonl` for appending and start the writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(run_dir: impl AsRef<Path>, run_id: impl Into<String>) -> ForemanResult<Self> {
        let run_dir = run_dir.as_ref();
        tokio::fs::create_dir_all(run_dir).await?;
        let path = run_dir.join(EVENTS_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let log_path = path.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Append(record) => {
                        let line = match serde_json::to_string(&record) {
                            Ok(line) => format!("{line}\n"),
                            Err(e) => {
                                warn!(error = %e, "Event not serializable, dropped");
                                continue;
                            }
                        };
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(path = %log_path.display(), error = %e, "Event log write failed");
                        }
                    }
                    Command::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            warn!(path = %log_path.display(), error = %e, "Event log flush failed");
                        }
                        if done.send(()).is_err() {
                            debug!("Flush caller went away before the flush finished");
                        }
                    }
                }
            }
        });

        Ok(Self {
            run_id: run_id.into(),
            path,
            tx,
        })
    }

    /// Run this log belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Location of the JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event for writing.
    pub fn log(&self, event: RunEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            event,
        };
        if self.tx.send(Command::Append(record)).is_err() {
            debug!(run_id = %self.run_id, "Event log writer gone, event dropped");
        }
    }

    /// Wait until every event logged so far has been written.
    pub async fn flush(&self) -> ForemanResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| ForemanError::Session("event log writer stopped".into()))?;
        done_rx
            .await
            .map_err(|_| ForemanError::Session("event log writer stopped".into()))
    }
}

impl MessageSink for EventLog {
    fn record(&self, message: &Message) {
        self.log(RunEvent::Message {
            message: message.clone(),
        });
    }
}

/// Read every record of an event log file.
///
/// A line that does not parse is reported as corruption with its line number.
pub async fn read_events(path: impl AsRef<Path>) -> ForemanResult<Vec<EventRecord>> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path).await?;
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                ForemanError::Corruption(format!("{}:{}: {e}", path.display(), n + 1))
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_bus::{MessageBus, MessageKind};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), "run-1").await.unwrap();

        log.log(RunEvent::RunStarted { tasks: 2 });
        log.log(RunEvent::TaskTransition {
            task_id: "T1".into(),
            from: "ready".into(),
            to: "running".into(),
        });
        log.log(RunEvent::RunFinished {
            reason: "ALL_TASKS_DONE".into(),
            exit_code: 0,
        });
        log.flush().await.unwrap();

        let events = read_events(log.path()).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, RunEvent::RunStarted { tasks: 2 });
        assert!(events.iter().all(|e| e.run_id == "run-1"));
        assert!(matches!(events[2].event, RunEvent::RunFinished { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn test_bus_sink_records_messages() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path(), "run-2").await.unwrap();
        let bus = MessageBus::new();
        bus.set_sink(Arc::new(log.clone()));

        bus.send(Message::new(
            MessageKind::Assignment,
            "coordinator",
            "executor",
            serde_json::json!({"task_id": "T1"}),
        ))
        .unwrap();
        log.flush().await.unwrap();

        let events = read_events(log.path()).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].event {
            RunEvent::Message { message } => assert_eq!(message.kind, MessageKind::Assignment),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..2 {
            let log = EventLog::open(dir.path(), "run-3").await.unwrap();
            log.log(RunEvent::RunStarted { tasks: 0 });
            log.flush().await.unwrap();
        }
        let events = read_events(dir.path().join("events.jsonl")).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_line_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"oops\": true}\n").unwrap();
        let err = read_events(&path).await.unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
