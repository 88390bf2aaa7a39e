//! Torrent transition detection.
//!
//! The [`Detector`] keeps one [`JobEntry`] per torrent it has seen and, on each
//! poll, diffs the fresh [`JobSnapshot`] against those entries. Transitions are
//! decided by [`RULES`], an ordered list of pure functions evaluated against the
//! entry as it stood at the start of the poll. Each rule may raise one alert and
//! request one [`Patch`]; patches are applied in rule order once every rule has
//! been evaluated, so a later patch wins over an earlier one.
//!
//! A poll is all-or-nothing at the snapshot level: if the status file cannot be
//! read or parsed, no entry is touched.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvent, AlertSink};
use crate::snapshot::{
    ControlState, JobSnapshot, JobStats, JobStatus, SnapshotError, SnapshotProvider,
};

/// Consecutive zero-rate polls before a running torrent counts as stalled.
pub const STALL_THRESHOLD: u32 = 3;
pub const HALFWAY_PERCENT: f64 = 50.0;
pub const COMPLETE_PERCENT: f64 = 100.0;

/// Alerts that fire at most once over the life of a tracked torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OneShot {
    Complete,
    Halfway,
}

/// What the detector remembers about one torrent between polls.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub name: String,
    pub last_state: ControlState,
    pub last_progress: f64,
    pub stalled_counter: u32,
    fired: BTreeSet<OneShot>,
}

impl JobEntry {
    fn new(status: &JobStatus) -> Self {
        Self {
            name: status.name.clone(),
            last_state: status.state.clone(),
            last_progress: status.progress(),
            stalled_counter: 0,
            fired: BTreeSet::new(),
        }
    }

    pub fn has_fired(&self, shot: OneShot) -> bool {
        self.fired.contains(&shot)
    }

    fn apply(&mut self, patch: Patch) {
        match patch {
            // Insert-only: one-shot flags never clear.
            Patch::MarkFired(shot) => {
                self.fired.insert(shot);
            }
            Patch::StalledCounter(count) => self.stalled_counter = count,
        }
    }
}

/// Entry change requested by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Patch {
    MarkFired(OneShot),
    StalledCounter(u32),
}

#[derive(Debug, Default)]
struct Verdict {
    alert: Option<AlertEvent>,
    patch: Option<Patch>,
}

impl Verdict {
    fn fire(alert: AlertEvent) -> Self {
        Self {
            alert: Some(alert),
            patch: None,
        }
    }

    fn patch(patch: Patch) -> Self {
        Self {
            alert: None,
            patch: Some(patch),
        }
    }

    fn with(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }
}

/// One torrent's fields on the current poll.
struct Observation<'a> {
    id: &'a str,
    status: &'a JobStatus,
    progress: f64,
}

impl Observation<'_> {
    fn is_active(&self) -> bool {
        self.status.state.is_running() && self.status.rate_bps > 0.0 && self.status.peers > 0
    }
}

type Rule = fn(&JobEntry, &Observation<'_>) -> Verdict;

/// Transition rules in evaluation order. The order decides which patch wins
/// when two rules touch the stall counter in the same poll.
const RULES: [(&str, Rule); 5] = [
    ("completion", completion),
    ("halfway", halfway),
    ("paused", paused),
    ("stalled", stalled),
    ("resumed", resumed),
];

fn completion(entry: &JobEntry, obs: &Observation<'_>) -> Verdict {
    if obs.status.state != ControlState::Completed || entry.has_fired(OneShot::Complete) {
        return Verdict::default();
    }
    Verdict::fire(AlertEvent::completed(obs.id, &obs.status.name))
        .with(Patch::MarkFired(OneShot::Complete))
}

fn halfway(entry: &JobEntry, obs: &Observation<'_>) -> Verdict {
    if !(HALFWAY_PERCENT..COMPLETE_PERCENT).contains(&obs.progress)
        || entry.has_fired(OneShot::Halfway)
    {
        return Verdict::default();
    }
    Verdict::fire(AlertEvent::halfway(obs.id, &obs.status.name, obs.progress))
        .with(Patch::MarkFired(OneShot::Halfway))
}

fn paused(entry: &JobEntry, obs: &Observation<'_>) -> Verdict {
    if obs.status.state.is_paused() && !entry.last_state.is_paused() {
        Verdict::fire(AlertEvent::paused(obs.id, &obs.status.name))
    } else {
        Verdict::default()
    }
}

fn stalled(entry: &JobEntry, obs: &Observation<'_>) -> Verdict {
    if !obs.status.state.is_running() || obs.progress >= COMPLETE_PERCENT {
        return Verdict::default();
    }
    if obs.status.rate_bps > 0.0 {
        return Verdict::patch(Patch::StalledCounter(0));
    }

    let count = entry.stalled_counter.saturating_add(1);
    let verdict = Verdict::patch(Patch::StalledCounter(count));
    // Exactly at the threshold, so one alert per stall episode.
    if count == STALL_THRESHOLD {
        Verdict {
            alert: Some(AlertEvent::stalled(obs.id, &obs.status.name)),
            ..verdict
        }
    } else {
        verdict
    }
}

fn resumed(entry: &JobEntry, obs: &Observation<'_>) -> Verdict {
    // Reads the counter from before this poll's stall rule.
    let was_stalled = entry.stalled_counter >= STALL_THRESHOLD;
    let was_paused = entry.last_state.is_paused();
    if (was_stalled || was_paused) && obs.is_active() {
        Verdict::fire(AlertEvent::resumed(
            obs.id,
            &obs.status.name,
            obs.status.peers,
        ))
        .with(Patch::StalledCounter(0))
    } else {
        Verdict::default()
    }
}

/// Per-torrent entries keyed by info hash. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetainedState {
    jobs: BTreeMap<String, JobEntry>,
}

impl RetainedState {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&JobEntry> {
        self.jobs.get(id)
    }

    /// Diffs `snapshot` against the retained entries, updates them, and
    /// returns the alerts raised, deletions first.
    pub fn reconcile(&mut self, snapshot: &JobSnapshot) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();

        let gone: Vec<String> = self
            .jobs
            .keys()
            .filter(|id| !snapshot.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(entry) = self.jobs.remove(&id) {
                info!(job_id = %id, name = %entry.name, "Torrent removed");
                alerts.push(AlertEvent::deleted(&id, &entry.name));
            }
        }

        for (id, anomaly) in snapshot.anomalies() {
            warn!(job_id = %id, error = %anomaly, "Skipping torrent entry this poll");
        }

        for (id, status) in snapshot.jobs() {
            let Some(entry) = self.jobs.get_mut(id) else {
                debug!(job_id = %id, name = %status.name, "Tracking new torrent");
                self.jobs.insert(id.clone(), JobEntry::new(status));
                continue;
            };

            let obs = Observation {
                id,
                status,
                progress: status.progress(),
            };
            let verdicts: Vec<(&str, Verdict)> = RULES
                .iter()
                .map(|(rule_name, rule)| (*rule_name, rule(&*entry, &obs)))
                .collect();
            for (rule_name, verdict) in verdicts {
                if let Some(alert) = verdict.alert {
                    debug!(job_id = %id, rule = rule_name, kind = alert.kind.as_str(), "Rule fired");
                    alerts.push(alert);
                }
                if let Some(patch) = verdict.patch {
                    entry.apply(patch);
                }
            }

            entry.last_state = status.state.clone();
            entry.last_progress = obs.progress;
            entry.name = status.name.clone();
        }

        alerts
    }
}

/// Health of the watched status file as of the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHealth {
    /// No poll has completed yet.
    Unknown,
    Available,
    /// The file was missing or could not be read.
    Unavailable,
    /// The file exists but did not parse.
    Malformed,
}

impl SourceHealth {
    /// Whether the status file was present on the last poll.
    pub fn is_present(&self) -> bool {
        matches!(self, SourceHealth::Available | SourceHealth::Malformed)
    }
}

/// Read-only view of the detector for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorStatus {
    pub tracked_jobs: usize,
    pub source: SourceHealth,
    /// Counts from the last snapshot that parsed.
    pub stats: JobStats,
    pub last_error: Option<String>,
}

/// Result of one [`Detector::poll`].
#[derive(Debug, Clone)]
pub struct PollReport {
    pub alerts: Vec<AlertEvent>,
    pub status: DetectorStatus,
}

struct Inner {
    retained: RetainedState,
    source: SourceHealth,
    stats: JobStats,
    last_error: Option<String>,
}

impl Inner {
    fn status(&self) -> DetectorStatus {
        DetectorStatus {
            tracked_jobs: self.retained.len(),
            source: self.source,
            stats: self.stats,
            last_error: self.last_error.clone(),
        }
    }
}

/// Owns the retained state. Polls and status queries serialize on one lock.
pub struct Detector {
    inner: Mutex<Inner>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                retained: RetainedState::default(),
                source: SourceHealth::Unknown,
                stats: JobStats::default(),
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches a snapshot, reconciles it and hands every alert to `sink`.
    /// Sink failures are logged; the state change that raised the alert stands.
    pub fn poll(&self, provider: &dyn SnapshotProvider, sink: &dyn AlertSink) -> PollReport {
        let mut inner = self.lock();

        let snapshot = match provider.fetch() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                match &err {
                    SnapshotError::Unavailable { .. } => {
                        debug!(error = %err, "Status file unavailable; skipping poll");
                        inner.source = SourceHealth::Unavailable;
                    }
                    SnapshotError::Malformed { .. } => {
                        error!(error = %err, "Status file malformed; skipping poll");
                        inner.source = SourceHealth::Malformed;
                    }
                }
                inner.last_error = Some(err.to_string());
                return PollReport {
                    alerts: Vec::new(),
                    status: inner.status(),
                };
            }
        };

        inner.source = SourceHealth::Available;
        inner.stats = snapshot.stats();
        inner.last_error = None;
        let alerts = inner.retained.reconcile(&snapshot);

        for alert in &alerts {
            if let Err(err) = sink.deliver(alert) {
                warn!(
                    error = %err,
                    kind = alert.kind.as_str(),
                    job_id = alert.job_id.as_deref().unwrap_or("-"),
                    "Alert delivery failed"
                );
            }
        }

        PollReport {
            alerts,
            status: inner.status(),
        }
    }

    /// Reconciles an already-fetched snapshot without touching source health.
    pub fn reconcile(&self, snapshot: &JobSnapshot) -> Vec<AlertEvent> {
        self.lock().retained.reconcile(snapshot)
    }

    pub fn status(&self) -> DetectorStatus {
        self.lock().status()
    }

    /// Copy of the retained state, taken under the lock.
    pub fn retained(&self) -> RetainedState {
        self.lock().retained.clone()
    }
}
