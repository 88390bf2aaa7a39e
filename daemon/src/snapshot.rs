//! Status-file snapshots: the read-only view of every torrent on one poll.
//!
//! The torrent client periodically rewrites a JSON document of the form
//!
//! ```json
//! { "run_time": 100, "torrents": { "<info hash>": { "torrent_name": "...", ... } } }
//! ```
//!
//! Only the `torrents` table is required. Entries inside it are parsed one at a
//! time so a single broken entry is reported as a [`JobAnomaly`] rather than
//! failing the whole snapshot.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Control-state label reported by the torrent client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ControlState {
    Running,
    Seeding,
    Paused,
    Stopped,
    Completed,
    /// Any label the detector has no rule for (e.g. "Validating").
    Other(String),
}

impl ControlState {
    /// Running or seeding: the states in which a zero download rate means a stall.
    pub fn is_running(&self) -> bool {
        matches!(self, ControlState::Running | ControlState::Seeding)
    }

    /// Paused or stopped by the user.
    pub fn is_paused(&self) -> bool {
        matches!(self, ControlState::Paused | ControlState::Stopped)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ControlState::Running => "Running",
            ControlState::Seeding => "Seeding",
            ControlState::Paused => "Paused",
            ControlState::Stopped => "Stopped",
            ControlState::Completed => "Completed",
            ControlState::Other(label) => label,
        }
    }
}

impl From<String> for ControlState {
    fn from(label: String) -> Self {
        match label.as_str() {
            "Running" => ControlState::Running,
            "Seeding" => ControlState::Seeding,
            "Paused" => ControlState::Paused,
            "Stopped" => ControlState::Stopped,
            "Completed" => ControlState::Completed,
            _ => ControlState::Other(label),
        }
    }
}

impl From<&str> for ControlState {
    fn from(label: &str) -> Self {
        ControlState::from(label.to_string())
    }
}

/// One torrent as reported in the status file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobStatus {
    #[serde(rename = "torrent_name")]
    pub name: String,
    #[serde(rename = "torrent_control_state")]
    pub state: ControlState,
    #[serde(rename = "number_of_pieces_total")]
    pub total_units: u64,
    #[serde(rename = "number_of_pieces_completed")]
    pub completed_units: u64,
    /// Download rate in bytes per second.
    #[serde(rename = "download_speed_bps")]
    pub rate_bps: f64,
    #[serde(rename = "number_of_successfully_connected_peers")]
    pub peers: u64,
}

impl JobStatus {
    /// Completion percentage derived from the piece counts; 0 when the total is
    /// unknown. Capped at 100 when the client over-reports completed pieces.
    pub fn progress(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        (self.completed_units as f64 * 100.0 / self.total_units as f64).min(100.0)
    }

    fn validate(&self) -> Result<(), JobAnomaly> {
        if !self.rate_bps.is_finite() || self.rate_bps < 0.0 {
            return Err(JobAnomaly::InvalidRate(self.rate_bps));
        }
        Ok(())
    }
}

/// Why a single torrent entry was skipped for this poll.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobAnomaly {
    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error("invalid download rate: {0}")]
    InvalidRate(f64),
}

/// Snapshot-level failures. Either variant turns the whole poll into a no-op.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("status file unavailable: {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("status file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },
}

/// Torrent counts from a snapshot, as shown in the daemon status file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub done: usize,
}

#[derive(Deserialize)]
struct RawStatusFile {
    torrents: BTreeMap<String, Value>,
}

/// Every torrent in one status-file read, keyed by info hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot {
    jobs: BTreeMap<String, JobStatus>,
    anomalies: BTreeMap<String, JobAnomaly>,
}

impl JobSnapshot {
    /// Parses the status-file JSON. Fails only when the document itself or its
    /// `torrents` table is unusable; bad entries become anomalies. Bytes that
    /// are not UTF-8 fail like any other unparsable document.
    pub fn from_json(bytes: impl AsRef<[u8]>) -> Result<Self, serde_json::Error> {
        let raw: RawStatusFile = serde_json::from_slice(bytes.as_ref())?;
        let mut snapshot = JobSnapshot::default();
        for (id, value) in raw.torrents {
            let parsed = serde_json::from_value::<JobStatus>(value)
                .map_err(|err| JobAnomaly::Malformed(err.to_string()))
                .and_then(|status| status.validate().map(|()| status));
            match parsed {
                Ok(status) => {
                    snapshot.jobs.insert(id, status);
                }
                Err(anomaly) => {
                    snapshot.anomalies.insert(id, anomaly);
                }
            }
        }
        Ok(snapshot)
    }

    pub fn insert(&mut self, id: impl Into<String>, status: JobStatus) {
        let id = id.into();
        self.anomalies.remove(&id);
        self.jobs.insert(id, status);
    }

    pub fn jobs(&self) -> impl Iterator<Item = (&String, &JobStatus)> {
        self.jobs.iter()
    }

    pub fn anomalies(&self) -> impl Iterator<Item = (&String, &JobAnomaly)> {
        self.anomalies.iter()
    }

    /// True if the torrent is listed at all, even if its entry was unusable.
    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id) || self.anomalies.contains_key(id)
    }

    pub fn stats(&self) -> JobStats {
        let total = self.jobs.len() + self.anomalies.len();
        let done = self
            .jobs
            .values()
            .filter(|job| job.state == ControlState::Completed)
            .count();
        JobStats {
            total,
            pending: total - done,
            done,
        }
    }
}

/// Source of snapshots for the detector.
pub trait SnapshotProvider: Send + Sync {
    fn fetch(&self) -> Result<JobSnapshot, SnapshotError>;
}

/// Reads snapshots from the torrent client's JSON status file.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotProvider for StatusFile {
    fn fetch(&self) -> Result<JobSnapshot, SnapshotError> {
        // Missing file and read errors (e.g. mid-rewrite) are both "no data yet".
        let content = std::fs::read(&self.path).map_err(|err| SnapshotError::Unavailable {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        JobSnapshot::from_json(&content).map_err(|err| SnapshotError::Malformed {
            path: self.path.clone(),
            details: err.to_string(),
        })
    }
}
