//! Alert events raised by the detector and the sinks that deliver them.
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::config::AlertsConfig;

/// Kinds of alerts the daemon can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Completed,
    HalfwayProgress,
    Paused,
    Stalled,
    Resumed,
    Deleted,
    /// Sent on demand to check the configured sinks.
    Test,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Completed => "completed",
            AlertKind::HalfwayProgress => "halfway_progress",
            AlertKind::Paused => "paused",
            AlertKind::Stalled => "stalled",
            AlertKind::Resumed => "resumed",
            AlertKind::Deleted => "deleted",
            AlertKind::Test => "test",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertKind::Completed => "Superseedr - Download Complete",
            AlertKind::HalfwayProgress => "Superseedr - 50% Downloaded",
            AlertKind::Paused => "Superseedr - Torrent Paused",
            AlertKind::Stalled => "Superseedr - Torrent Stalled",
            AlertKind::Resumed => "Superseedr - Torrent Resumed",
            AlertKind::Deleted => "Superseedr - Torrent Deleted",
            AlertKind::Test => "Superseedr - Test Notification",
        }
    }
}

/// A single user-facing alert, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    /// Info hash of the torrent the alert is about; `None` for test alerts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl AlertEvent {
    fn for_job(kind: AlertKind, job_id: &str, message: String) -> Self {
        Self {
            kind,
            title: kind.title().to_string(),
            message,
            job_id: Some(job_id.to_string()),
        }
    }

    pub fn completed(job_id: &str, name: &str) -> Self {
        Self::for_job(
            AlertKind::Completed,
            job_id,
            format!("\"{name}\" has finished downloading!"),
        )
    }

    /// `progress` is truncated to a whole percentage in the message.
    pub fn halfway(job_id: &str, name: &str, progress: f64) -> Self {
        Self::for_job(
            AlertKind::HalfwayProgress,
            job_id,
            format!("\"{name}\" is halfway done ({}%).", progress.trunc() as u64),
        )
    }

    pub fn paused(job_id: &str, name: &str) -> Self {
        Self::for_job(AlertKind::Paused, job_id, format!("\"{name}\" has been paused."))
    }

    pub fn stalled(job_id: &str, name: &str) -> Self {
        Self::for_job(
            AlertKind::Stalled,
            job_id,
            format!("\"{name}\" has stalled (0 B/s)."),
        )
    }

    pub fn resumed(job_id: &str, name: &str, peers: u64) -> Self {
        Self::for_job(
            AlertKind::Resumed,
            job_id,
            format!("\"{name}\" is downloading again ({peers} peers)."),
        )
    }

    pub fn deleted(job_id: &str, name: &str) -> Self {
        Self::for_job(AlertKind::Deleted, job_id, format!("\"{name}\" has been removed."))
    }

    pub fn test(now: chrono::DateTime<chrono::Local>) -> Self {
        Self {
            kind: AlertKind::Test,
            title: AlertKind::Test.title().to_string(),
            message: format!(
                "Test notification sent at {}",
                now.format("%Y-%m-%d %H:%M:%S")
            ),
            job_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write alert journal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for alerts. Implementations must not block for long: they are
/// called while the detector holds its state lock.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError>;
}

/// Emits every alert as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        info!(
            kind = alert.kind.as_str(),
            job_id = alert.job_id.as_deref().unwrap_or("-"),
            title = %alert.title,
            "{}",
            alert.message
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct JournalLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    alert: &'a AlertEvent,
}

/// Appends one JSON object per alert to a file (JSON Lines).
#[derive(Debug, Clone)]
pub struct JournalSink {
    path: PathBuf,
}

impl JournalSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl AlertSink for JournalSink {
    fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(&JournalLine {
            timestamp: chrono::Local::now().to_rfc3339(),
            alert,
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io_err(e))
    }
}

/// Delivers to every child sink. All children are tried even if one fails;
/// the first failure is returned.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the sink set described by the `[alerts]` config table.
    pub fn from_config(config: &AlertsConfig) -> Self {
        let mut fan_out = Self::new();
        if config.log {
            fan_out.push(LogSink);
        }
        if let Some(path) = &config.journal_file {
            fan_out.push(JournalSink::new(path));
        }
        fan_out
    }

    pub fn push(&mut self, sink: impl AlertSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl AlertSink for FanOut {
    fn deliver(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(alert) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
