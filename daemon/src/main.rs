use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use seedwatch_daemon::alert::{AlertEvent, AlertSink, FanOut};
use seedwatch_daemon::config::{self, Config};
use seedwatch_daemon::detector::Detector;
use seedwatch_daemon::event::DaemonEvent;
use seedwatch_daemon::poller::{self, PollPlan};
use seedwatch_daemon::snapshot::StatusFile;
use seedwatch_daemon::{paths, status};

#[derive(Parser, Debug)]
#[command(version, about = "Raise alerts from a torrent client's status file")]
struct Cli {
    /// Config file (default: <data dir>/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Status file to watch; overrides `monitor.status_file`.
    #[arg(long, env = "STATUS_FILE")]
    status_file: Option<PathBuf>,
    /// Send one test alert through the configured sinks and exit.
    #[arg(long)]
    test_alert: bool,
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        error!(error = %e, dir = %app_dir.display(), "Failed to create data directory");
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths::config_file_path_in(&app_dir));
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "Config error; using defaults");
        Config::default()
    });

    if cli.test_alert {
        let sinks = FanOut::from_config(&initial_config.alerts);
        match sinks.deliver(&AlertEvent::test(chrono::Local::now())) {
            Ok(()) => info!(sinks = sinks.sink_count(), "Test alert sent"),
            Err(e) => {
                error!(error = %e, "Test alert failed");
                std::process::exit(1);
            }
        }
        return;
    }

    let watched_file = resolve_watched_file(&cli, &initial_config);
    let initial_plan = build_plan(&initial_config, &watched_file);

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path_in(&app_dir);
    let mut current_status = status::DaemonStatus::new(
        &watched_file,
        initial_plan.interval,
        configured_sinks(&initial_config),
    );
    status::write_status(&status_path, &current_status);

    let detector = Arc::new(Detector::new());
    let (plan_tx, plan_rx) = watch::channel(Arc::new(initial_plan));
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path.clone(), event_tx.clone()));
    tokio::spawn(poller::run(Arc::clone(&detector), plan_rx, event_tx.clone()));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        status_file = %watched_file.display(),
        config = %config_path.display(),
        interval_secs = current_status.poll_interval_secs,
        "seedwatch-daemon started"
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Polled(report) => {
                if !report.alerts.is_empty() {
                    info!(alerts = report.alerts.len(), "Poll raised alerts");
                }
                current_status.record_poll(&report.status);
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                let watched_file = resolve_watched_file(&cli, &new_config);
                let plan = build_plan(&new_config, &watched_file);
                info!(
                    status_file = %watched_file.display(),
                    interval_secs = plan.interval.as_secs(),
                    "Config reloaded"
                );
                current_status.status_file = watched_file.display().to_string();
                current_status.poll_interval_secs = plan.interval.as_secs();
                current_status.alert_sinks = configured_sinks(&new_config);
                status::write_status(&status_path, &current_status);
                plan_tx.send_replace(Arc::new(plan));
            }

            DaemonEvent::Shutdown => {
                info!("Shutting down");
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("SEEDWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The `--status-file` flag (or `$STATUS_FILE`) wins over the config file.
fn resolve_watched_file(cli: &Cli, config: &Config) -> PathBuf {
    cli.status_file
        .clone()
        .unwrap_or_else(|| config.monitor.status_file.clone())
}

fn build_plan(config: &Config, watched_file: &Path) -> PollPlan {
    PollPlan {
        interval: config.monitor.effective_poll_interval(),
        provider: Box::new(StatusFile::new(watched_file)),
        sink: Box::new(FanOut::from_config(&config.alerts)),
    }
}

fn configured_sinks(config: &Config) -> usize {
    FanOut::from_config(&config.alerts).sink_count()
}
