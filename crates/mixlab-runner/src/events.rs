//! The run's event log: one JSON object per line, appended per write.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::RunError;

pub const RUN_START: &str = "run_start";
pub const WAIT_FOR_CLEAR_START: &str = "wait_for_clear_start";
pub const WAIT_FOR_CLEAR_FINISHED: &str = "wait_for_clear_finished";
pub const DEPLOYMENT: &str = "deployment";
pub const STEADY_START: &str = "steady_start";
pub const PUBLISHER_DEPLOY_START: &str = "publisher_deploy_start";
pub const PUBLISHER_MESSAGES_FINISHED: &str = "publisher_messages_finished";
pub const PUBLISHER_WAIT_FINISHED: &str = "publisher_wait_finished";
pub const STEADY_END: &str = "steady_end";
pub const INTERNAL_RUN_FINISHED: &str = "internal_run_finished";
pub const METADATA: &str = "metadata";
pub const RUN_ERROR: &str = "run_error";
pub const CLEANUP_START: &str = "cleanup_start";
pub const CLEANUP_FINISHED: &str = "cleanup_finished";
pub const RUN_FINISHED: &str = "run_finished";

pub fn format_event_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_event_time(raw: &str) -> Result<DateTime<Utc>, RunError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RunError::Timestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Append-only writer. The file is reopened for every event, so the log is
/// complete up to the last successful write even if the process dies.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `{timestamp, event, ..fields}`. Non-object `fields` are stored
    /// under `value`.
    pub fn log(&self, event: &str, fields: Value) -> Result<Value, RunError> {
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            Value::String(format_event_time(Utc::now())),
        );
        record.insert("event".to_string(), Value::String(event.to_string()));
        match fields {
            Value::Object(extra) => {
                for (k, v) in extra {
                    if k != "timestamp" && k != "event" {
                        record.insert(k, v);
                    }
                }
            }
            Value::Null => {}
            other => {
                record.insert("value".to_string(), other);
            }
        }
        let record = Value::Object(record);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;

        info!(event, fields = %record, "event");
        Ok(record)
    }

    pub fn read(&self) -> Result<Vec<Value>, RunError> {
        read_events(&self.path)
    }
}

/// Reads every event in `path`. Blank lines are skipped; anything else that
/// is not a JSON object with an `event` tag fails the whole read.
pub fn read_events(path: &Path) -> Result<Vec<Value>, RunError> {
    let text = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| RunError::MalformedEvent {
            path: path.to_path_buf(),
            line: idx + 1,
            reason,
        };
        let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(malformed("not a JSON object".to_string()));
        }
        if value.get("event").and_then(Value::as_str).is_none() {
            return Err(malformed("missing 'event' tag".to_string()));
        }
        events.push(value);
    }
    Ok(events)
}
