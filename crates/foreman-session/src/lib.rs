//! Persistent run state for Foreman.
//!
//! Every run gets a directory `<data_dir>/runs/<run_id>/` holding:
//!
//! - `snapshot.json` and `report.json`, written by [`RunStore`] inside a
//!   SHA-256 checksum envelope (a mismatch on load is a critical
//!   [`foreman_core::ForemanError::Corruption`]);
//! - `events.jsonl`, the append-only [`EventLog`] of messages, task
//!   transitions and halts.

/// Append-only JSONL event log.
pub mod events;
/// Checksummed snapshot and report files.
pub mod store;

pub use events::{read_events, EventLog, EventRecord, RunEvent};
pub use store::{new_run_id, RunStore};
