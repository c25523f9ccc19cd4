use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Whether the monitoring scheduler is currently running.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    /// No timer is scheduled; no groups are being evaluated.
    Stopped,
    /// Groups are evaluated on every tick.
    Running,
}

/// Runtime status written by the daemon to `<config dir>/Pairkiller/status.toml`.
/// The settings UI reads this file (read-only) for its passive indicators.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Current scheduler state.
    pub state: MonitorState,
    /// Number of configured groups (enabled or not).
    pub group_count: usize,
    /// RFC 3339 timestamp of the last state change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Human-readable error message if monitoring could not be started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial stopped status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: MonitorState::Stopped,
            group_count: 0,
            updated_at: None,
            error: None,
        }
    }

    /// Records the current scheduler state and stamps the change time.
    pub fn update(&mut self, monitoring: bool, group_count: usize) {
        self.state = if monitoring {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        };
        self.group_count = group_count;
        self.updated_at = Some(chrono::Local::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking; a failed status write never stops the daemon.
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
                warn!(error = %e, "Failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize status"),
    }
}
