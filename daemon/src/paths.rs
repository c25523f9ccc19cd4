/// Canonical file paths for Pairkiller data files.
///
/// Both files live under `<config dir>/Pairkiller/` (`%APPDATA%` on Windows,
/// `~/Library/Application Support` on macOS, `$XDG_CONFIG_HOME` elsewhere):
///   - config.toml  Written by the settings UI, read by the daemon.
///   - status.toml  Written by the daemon, read by the settings UI.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "Pairkiller";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the Pairkiller application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("No per-user config directory on this platform")?;
    Ok(base.join(APP_DIR_NAME))
}

/// Returns the full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file.
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

/// Makes a user-supplied path absolute against the working directory, so a
/// bare `config.toml` still has a parent directory to watch.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("Failed to resolve path {}", path.display()))
}
