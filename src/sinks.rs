//! Output boundaries of the pipeline.
//!
//! The pipeline hands finished records to an [`EventSink`] and user-facing
//! messages to a [`NotificationSink`]. Both are fire-and-forget: a sink logs
//! its own failures and never blocks or fails the stage that called it.

use crate::core::{DistractionEvent, StateTransition};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-sample progress reported by the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// Camera (and possibly screen) classified and forwarded to fusion
    Classified {
        sample_id: Uuid,
        latency_ms: u64,
        has_screen: bool,
    },
    /// Camera classification failed for good; the sample was dropped
    Failed { sample_id: Uuid, error: String },
    /// A queue was full and this sample was evicted unprocessed
    Dropped { sample_id: Uuid, queue: String },
    /// A capture tick produced nothing
    CaptureSkipped { error: String },
}

/// Everything the pipeline records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", content = "data", rename_all = "snake_case")]
pub enum SinkRecord {
    Status {
        at: DateTime<Utc>,
        update: StatusUpdate,
    },
    Transition(StateTransition),
    Event(DistractionEvent),
}

impl SinkRecord {
    pub fn status(update: StatusUpdate) -> Self {
        SinkRecord::Status {
            at: Utc::now(),
            update,
        }
    }
}

/// Receives records for persistence.
pub trait EventSink: Send + Sync {
    fn record(&self, record: SinkRecord);
}

/// Kind of user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Early, unconfirmed alert at episode start
    HeadsUp,
    Confirmed,
    /// Micro-break suggestion
    Overload,
    /// Classifier unreachable
    Degraded,
    Recovered,
}

/// A user-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Receives user-facing messages. Must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _record: SinkRecord) {}
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// Confirmed distraction events recorded so far.
    pub fn events(&self) -> Vec<DistractionEvent> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, record: SinkRecord) {
        self.records.lock().push(record);
    }
}

/// Appends one JSON object per record to a file.
pub struct JsonlEventSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// A new session file under `export_dir`.
    pub fn for_session(export_dir: &Path) -> Result<Self, std::io::Error> {
        Self::create(export_dir.join(format!(
            "session_{}.jsonl",
            Utc::now().format("%Y%m%d_%H%M%S")
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, record: SinkRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Could not serialize record");
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(path = ?self.path, error = %e, "Could not write record");
        }
    }
}

/// Delivers notifications through a bounded channel, dropping on overflow.
pub struct ChannelNotifier {
    sender: Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, Receiver<Notification>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(kind = ?n.kind, title = %n.title, "Notification queue full, dropping");
            }
            Err(TrySendError::Disconnected(n)) => {
                debug!(kind = ?n.kind, "Notification receiver gone, dropping");
            }
        }
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            kind = ?notification.kind,
            "[{}] {}",
            notification.title,
            notification.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_drops_when_full() {
        let (notifier, receiver) = ChannelNotifier::new(2);
        for i in 0..5 {
            notifier.notify(Notification::new(NotificationKind::HeadsUp, format!("n{i}"), ""));
        }
        let received: Vec<String> = receiver.try_iter().map(|n| n.title).collect();
        assert_eq!(received, vec!["n0", "n1"]);
    }

    #[test]
    fn test_channel_notifier_survives_dropped_receiver() {
        let (notifier, receiver) = ChannelNotifier::new(1);
        drop(receiver);
        notifier.notify(Notification::new(NotificationKind::Degraded, "x", "y"));
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let path = std::env::temp_dir()
            .join("focus-sentinel-test")
            .join(format!("{}.jsonl", Uuid::new_v4()));
        let sink = JsonlEventSink::create(&path).unwrap();

        sink.record(SinkRecord::status(StatusUpdate::Failed {
            sample_id: Uuid::nil(),
            error: "timeout".to_string(),
        }));
        sink.record(SinkRecord::status(StatusUpdate::CaptureSkipped {
            error: "camera busy".to_string(),
        }));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"], "status");
        assert_eq!(lines[0]["data"]["update"]["status"], "failed");
        assert_eq!(lines[1]["data"]["update"]["error"], "camera busy");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memory_sink_filters_events() {
        let sink = MemoryEventSink::new();
        sink.record(SinkRecord::status(StatusUpdate::CaptureSkipped {
            error: "x".to_string(),
        }));
        assert_eq!(sink.records().len(), 1);
        assert!(sink.events().is_empty());
    }
}
