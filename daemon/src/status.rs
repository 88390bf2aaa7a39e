use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::detector::{DetectorStatus, SourceHealth};
use crate::snapshot::JobStats;

/// Runtime status written by the daemon to `<data dir>/status.toml` after every
/// poll. Other tools read this file (read-only) to see what the daemon is doing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Torrent client status file being watched.
    pub status_file: String,
    /// Health of the watched file as of the last poll.
    pub source: SourceHealth,
    /// Whether the watched file was present on the last poll.
    pub source_available: bool,
    /// Torrents currently tracked by the detector.
    pub tracked_jobs: usize,
    pub poll_interval_secs: u64,
    /// Number of configured alert sinks.
    pub alert_sinks: usize,
    /// RFC 3339 timestamp of the most recent poll, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<String>,
    /// Human-readable error from the most recent poll, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Torrent counts from the last status file that parsed.
    pub stats: JobStats,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup, before any poll.
    pub fn new(status_file: &Path, poll_interval: Duration, alert_sinks: usize) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            status_file: status_file.display().to_string(),
            source: SourceHealth::Unknown,
            source_available: false,
            tracked_jobs: 0,
            poll_interval_secs: poll_interval.as_secs(),
            alert_sinks,
            last_poll: None,
            error: None,
            stats: JobStats::default(),
        }
    }

    /// Copies the detector's view into the status and stamps the poll time.
    pub fn record_poll(&mut self, detector: &DetectorStatus) {
        self.source = detector.source;
        self.source_available = detector.source.is_present();
        self.tracked_jobs = detector.tracked_jobs;
        self.stats = detector.stats;
        self.error = detector.last_error.clone();
        self.last_poll = Some(chrono::Local::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// A failed write is logged and otherwise ignored.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(error = %e, dir = %parent.display(), "Failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(error = %e, path = %path.display(), "Failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize status"),
    }
}
