use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::DaemonEvent;
use crate::migrate;
use crate::observer::process_name_from_path;

pub const MIN_INTERVAL_MS: u64 = 500;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 2_500;
pub const MAX_CACHE_TTL_MS: u64 = 10_000;
pub const DEFAULT_CACHE_TTL_MS: u64 = 2_000;
pub const MIN_QUERY_TIMEOUT_MS: u64 = 500;
pub const MAX_QUERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 4_000;

/// Root configuration structure. Deserialized from `<config dir>/Pairkiller/config.toml`
/// after [`migrate::migrate`] has brought it up to the current shape.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub app_groups: Vec<AppGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            monitoring: MonitoringConfig::default(),
            app_groups: Vec::new(),
        }
    }
}

/// Polling settings. All durations are in milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MonitoringConfig {
    /// Whether monitoring runs at all. The tray toggle flips this.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay between evaluation passes. Clamped to [500, 60000].
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// How long a process-existence answer is reused. Clamped to [0, 10000].
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Bound on each OS query, start and stop. Clamped to [500, 30000].
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_INTERVAL_MS,
            cache_ttl: DEFAULT_CACHE_TTL_MS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

impl MonitoringConfig {
    pub fn effective_interval(&self) -> Duration {
        Duration::from_millis(self.interval.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS))
    }

    pub fn effective_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl.min(MAX_CACHE_TTL_MS))
    }

    pub fn effective_query_timeout(&self) -> Duration {
        Duration::from_millis(
            self.query_timeout
                .clamp(MIN_QUERY_TIMEOUT_MS, MAX_QUERY_TIMEOUT_MS),
        )
    }
}

/// How the monitored apps of a group combine into one boolean.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// At least one monitored app is running.
    #[default]
    #[serde(alias = "ANY", alias = "Any")]
    Any,
    /// Every monitored app is running (and there is at least one).
    #[serde(alias = "ALL", alias = "All")]
    All,
}

/// Maps a group's condition onto a controlled app's desired running state.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Run while the condition holds.
    #[serde(alias = "START", alias = "Start")]
    Start,
    /// Run while the condition does not hold.
    #[serde(alias = "STOP", alias = "Stop")]
    Stop,
    /// Same as `Start`; kept separate for the settings UI.
    #[default]
    #[serde(alias = "SYNC", alias = "Sync")]
    Sync,
    /// Same as `Stop`; kept separate for the settings UI.
    #[serde(alias = "OPPOSITE", alias = "Opposite")]
    Opposite,
}

/// A named unit of monitoring and control.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppGroup {
    #[serde(default)]
    pub name: String,
    /// Disabled groups are skipped by every pass.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Condition,
    /// Inverts the computed condition before reconciliation.
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub monitored_apps: Vec<AppRef>,
    #[serde(default)]
    pub controlled_apps: Vec<ControlledApp>,
}

/// A process observed by name (e.g. "LeagueClient.exe").
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppRef {
    #[serde(default)]
    pub name: String,
}

/// A process the daemon starts and stops.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ControlledApp {
    #[serde(default)]
    pub name: String,
    /// Executable or bundle to launch. Empty means "launched by other means".
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub action: Action,
}

impl ControlledApp {
    /// Name used for existence checks and termination: the configured name,
    /// or the path's basename when no name was given.
    pub fn process_name(&self) -> Option<String> {
        let name = self.name.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
        process_name_from_path(&self.path)
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
    parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parses TOML text, migrating older shapes before deserializing.
pub fn parse(content: &str) -> Result<Config> {
    let table: toml::Table = toml::from_str(content)?;
    let migrated = migrate::migrate(table);
    Ok(toml::Value::Table(migrated).try_into::<Config>()?)
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
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
            warn!(error = %e, "Failed to create config file watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            warn!(path = %path.display(), "Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        warn!(error = %e, dir = %watch_dir.display(), "Failed to create config directory");
        return;
    }
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!(error = %e, "Failed to watch config directory");
        return;
    }
    info!(dir = %watch_dir.display(), "Watching config directory");

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
                Err(e) => warn!(error = format!("{e:#}"), "Failed to reload config"),
            }
        }
    }
}

fn default_config_version() -> String {
    migrate::CURRENT_CONFIG_VERSION.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}
