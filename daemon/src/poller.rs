use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::alert::AlertSink;
use crate::detector::Detector;
use crate::event::DaemonEvent;
use crate::snapshot::SnapshotProvider;

/// Everything one poll needs. Replaced wholesale when the config changes.
pub struct PollPlan {
    pub interval: Duration,
    pub provider: Box<dyn SnapshotProvider>,
    pub sink: Box<dyn AlertSink>,
}

/// Polls the status file every `plan.interval` and emits a
/// [`DaemonEvent::Polled`] after each poll.
///
/// Each poll runs on a blocking thread and is awaited before the next tick is
/// taken, so polls never overlap. Missed ticks are skipped rather than
/// replayed. A new plan on `plans` takes effect from the next tick; a changed
/// interval restarts the ticker one full period from now.
pub async fn run(
    detector: Arc<Detector>,
    mut plans: watch::Receiver<Arc<PollPlan>>,
    tx: mpsc::Sender<DaemonEvent>,
) {
    let mut plan = Arc::clone(&plans.borrow_and_update());
    let mut ticker = start_ticker(interval(plan.interval));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = plans.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = Arc::clone(&plans.borrow_and_update());
                if next.interval != plan.interval {
                    info!(
                        interval_secs = next.interval.as_secs_f64(),
                        "Poll interval changed; rescheduling"
                    );
                    let start = Instant::now() + next.interval;
                    ticker = start_ticker(interval_at(start, next.interval));
                }
                plan = next;
                continue;
            }
        }

        let poll_detector = Arc::clone(&detector);
        let poll_plan = Arc::clone(&plan);
        let report = tokio::task::spawn_blocking(move || {
            poll_detector.poll(poll_plan.provider.as_ref(), poll_plan.sink.as_ref())
        })
        .await;

        match report {
            Ok(report) => {
                if tx.send(DaemonEvent::Polled(report)).await.is_err() {
                    break;
                }
            }
            Err(e) => error!(error = %e, "Poll task panicked"),
        }
    }
}

fn start_ticker(mut ticker: Interval) -> Interval {
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingSink;
    use crate::alert::AlertKind;
    use crate::detector::testing::{job, snapshot_of, StaticProvider};
    use crate::detector::SourceHealth;
    use crate::snapshot::{JobSnapshot, SnapshotError};
    use std::sync::Mutex;

    /// Serves a scripted sequence of snapshots, then repeats the last one.
    struct Scripted {
        snapshots: Mutex<Vec<JobSnapshot>>,
    }

    impl SnapshotProvider for Scripted {
        fn fetch(&self) -> Result<JobSnapshot, SnapshotError> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots[0].clone())
            }
        }
    }

    fn plan(
        interval_ms: u64,
        provider: impl SnapshotProvider + 'static,
        sink: RecordingSink,
    ) -> Arc<PollPlan> {
        Arc::new(PollPlan {
            interval: Duration::from_millis(interval_ms),
            provider: Box::new(provider),
            sink: Box::new(sink),
        })
    }

    async fn next_report(rx: &mut mpsc::Receiver<DaemonEvent>) -> PollReportView {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no poll within timeout")
            .expect("poller stopped");
        match event {
            DaemonEvent::Polled(report) => PollReportView {
                kinds: report.alerts.iter().map(|a| a.kind).collect(),
                source: report.status.source,
                tracked: report.status.tracked_jobs,
            },
            _ => panic!("unexpected event"),
        }
    }

    struct PollReportView {
        kinds: Vec<AlertKind>,
        source: SourceHealth,
        tracked: usize,
    }

    #[tokio::test]
    async fn polls_repeatedly_and_delivers_alerts() {
        let sink = RecordingSink::default();
        let provider = Scripted {
            snapshots: Mutex::new(vec![
                snapshot_of(&[("h", job("a", "Running", 10, 100.0, 1))]),
                snapshot_of(&[("h", job("a", "Paused", 10, 0.0, 0))]),
                JobSnapshot::default(),
            ]),
        };
        let (_plan_tx, plan_rx) = watch::channel(plan(10, provider, sink.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let detector = Arc::new(Detector::new());
        let handle = tokio::spawn(run(Arc::clone(&detector), plan_rx, tx));

        let first = next_report(&mut rx).await;
        assert!(first.kinds.is_empty());
        assert_eq!(first.tracked, 1);
        assert_eq!(next_report(&mut rx).await.kinds, vec![AlertKind::Paused]);
        let third = next_report(&mut rx).await;
        assert_eq!(third.kinds, vec![AlertKind::Deleted]);
        assert_eq!(third.tracked, 0);

        let delivered: Vec<_> = sink.take().into_iter().map(|a| a.kind).collect();
        assert_eq!(delivered, vec![AlertKind::Paused, AlertKind::Deleted]);
        handle.abort();
    }

    #[tokio::test]
    async fn new_plan_switches_provider_without_losing_state() {
        let sink = RecordingSink::default();
        let running = StaticProvider::Snapshot(snapshot_of(&[("h", job("a", "Running", 10, 0.0, 0))]));
        let (plan_tx, plan_rx) = watch::channel(plan(10, running, sink.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(Arc::new(Detector::new()), plan_rx, tx));

        assert_eq!(next_report(&mut rx).await.source, SourceHealth::Available);

        plan_tx.send_replace(plan(20, StaticProvider::Unavailable, sink.clone()));
        // Polls already queued under the old plan may still arrive.
        let mut report = next_report(&mut rx).await;
        while report.source == SourceHealth::Available {
            report = next_report(&mut rx).await;
        }
        assert_eq!(report.source, SourceHealth::Unavailable);
        assert_eq!(report.tracked, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn stops_when_event_receiver_is_dropped() {
        let sink = RecordingSink::default();
        let (_plan_tx, plan_rx) = watch::channel(plan(10, StaticProvider::Unavailable, sink));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = tokio::spawn(run(Arc::new(Detector::new()), plan_rx, tx));
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller kept running")
            .unwrap();
    }
}
