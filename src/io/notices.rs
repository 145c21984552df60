//! Typed channel for user-facing notices
//!
//! Notices are passive and dismissible: the engine never waits on them.
//! Sends use `try_send` on a bounded channel; drops are counted in metrics.
//! `NoticeSink` drains the channel, logs every notice, and optionally
//! appends it to a JSONL file.

use crate::domain::types::{CheckinId, VenueId};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Notice {
    /// Automatic check-in accepted; the undo action is offered for `undo_window_secs`
    CheckedIn {
        venue_id: VenueId,
        venue_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkin_id: Option<CheckinId>,
        undo_window_secs: u64,
    },
    CheckinFailed {
        venue_id: VenueId,
        venue_name: String,
        reason: String,
    },
    UndoSucceeded {
        checkin_id: CheckinId,
        venue_name: String,
    },
    UndoFailed {
        checkin_id: CheckinId,
        venue_name: String,
        reason: String,
    },
    /// The undo record lapsed; the check-in stands
    UndoExpired {
        checkin_id: CheckinId,
        venue_name: String,
    },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::CheckedIn { .. } => "checked_in",
            Notice::CheckinFailed { .. } => "checkin_failed",
            Notice::UndoSucceeded { .. } => "undo_succeeded",
            Notice::UndoFailed { .. } => "undo_failed",
            Notice::UndoExpired { .. } => "undo_expired",
        }
    }
}

/// Notice with its emission timestamp
#[derive(Debug, Serialize)]
pub struct NoticeEnvelope {
    pub ts: u64,
    #[serde(flatten)]
    pub notice: Notice,
}

/// Non-blocking sender for notices
#[derive(Clone)]
pub struct NoticeSender {
    tx: mpsc::Sender<NoticeEnvelope>,
    metrics: Arc<Metrics>,
}

impl NoticeSender {
    pub fn send(&self, notice: Notice) {
        let kind = notice.kind();
        match self.tx.try_send(NoticeEnvelope { ts: epoch_ms(), notice }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_notice_dropped();
                warn!(kind = %kind, "notice_dropped: channel full");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(kind = %kind, "notice_channel_closed");
            }
        }
    }
}

/// Create the notice channel
pub fn create_notice_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (NoticeSender, mpsc::Receiver<NoticeEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (NoticeSender { tx, metrics }, rx)
}

/// Drains notices to the log and an optional JSONL file
pub struct NoticeSink {
    file_path: Option<String>,
}

impl NoticeSink {
    pub fn new(file_path: Option<&str>) -> Self {
        if let Some(path) = file_path {
            info!(file_path = %path, "notice_sink_initialized");
        }
        Self { file_path: file_path.map(str::to_string) }
    }

    /// Run until every sender is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<NoticeEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            self.write(&envelope);
        }
        debug!("notice_sink_stopped");
    }

    fn write(&self, envelope: &NoticeEnvelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "notice_serialize_failed");
                return;
            }
        };

        info!(kind = %envelope.notice.kind(), notice = %json, "notice");

        if let Some(path) = &self.file_path {
            if let Err(e) = append_line(path, &json) {
                error!(file = %path, error = %e, "notice_write_failed");
            }
        }
    }
}

fn append_line(file_path: &str, line: &str) -> std::io::Result<()> {
    let path = Path::new(file_path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked_in() -> Notice {
        Notice::CheckedIn {
            venue_id: VenueId::new("v1"),
            venue_name: "Cafe".to_string(),
            checkin_id: Some(CheckinId::new("c1")),
            undo_window_secs: 10,
        }
    }

    #[test]
    fn test_notice_serialization_is_tagged() {
        let envelope = NoticeEnvelope { ts: 42, notice: checked_in() };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["t"], "checked_in");
        assert_eq!(json["ts"], 42);
        assert_eq!(json["checkin_id"], "c1");
        assert_eq!(json["undo_window_secs"], 10);
    }

    #[tokio::test]
    async fn test_full_channel_counts_drop() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_notice_channel(1, metrics.clone());

        sender.send(checked_in());
        sender.send(checked_in());

        assert!(rx.recv().await.is_some());
        assert_eq!(metrics.report().notices_dropped, 1);
    }

    #[tokio::test]
    async fn test_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notices.jsonl");
        let path_str = path.to_str().unwrap().to_string();

        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_notice_channel(8, metrics);
        sender.send(checked_in());
        sender.send(Notice::UndoExpired {
            checkin_id: CheckinId::new("c1"),
            venue_name: "Cafe".to_string(),
        });
        drop(sender);

        NoticeSink::new(Some(&path_str)).run(rx).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"t\":\"checked_in\""));
        assert!(lines[1].contains("\"t\":\"undo_expired\""));
    }
}
