/// Canonical file paths for seedwatch's own data files.
///
/// Both files live in the data directory (`$DATA_DIR`, else the platform data
/// directory joined with `seedwatch`):
///   - config.toml  Written by the user, read (and watched) by the daemon.
///   - status.toml  Written by the daemon after every poll.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "seedwatch";
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the data directory, honouring `$DATA_DIR`.
pub fn app_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME),
    }
}

pub fn config_file_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn status_file_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(STATUS_FILE_NAME)
}
