use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::event::DaemonEvent;

pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
/// Where the torrent client writes its status file inside its container.
pub const DEFAULT_STATUS_FILE: &str = "/data/status_files/app_state.json";

/// Root configuration structure. Deserialized from `<data dir>/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// What to watch and how often.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// JSON status file rewritten by the torrent client.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Seconds between polls. Clamped to at least one second.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            status_file: default_status_file(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn effective_poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }
}

/// Where alerts go.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Log every alert through the daemon's log output.
    #[serde(default = "default_true")]
    pub log: bool,
    /// Append alerts as JSON lines to this file.
    #[serde(default)]
    pub journal_file: Option<PathBuf>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            log: true,
            journal_file: None,
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`. Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "Failed to create config watcher");
            return;
        }
    };

    // Watch the directory so write-new + rename saves are seen too.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!(path = %path.display(), "Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!(error = %e, dir = %watch_dir.display(), "Failed to watch config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %format!("{e:#}"), "Failed to reload config; keeping current"),
            }
        }
    }
}

fn default_status_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATUS_FILE)
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}
