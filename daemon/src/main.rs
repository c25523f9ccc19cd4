mod config;
mod error;
mod evaluator;
mod event;
mod launcher;
mod migrate;
mod monitor;
mod observer;
mod oracle;
mod paths;
mod platform;
mod startup;
mod status;
#[cfg(test)]
mod testing;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::{ErrorReporter, TracingReporter};
use crate::evaluator::GroupEvaluator;
use crate::launcher::AppLauncher;
use crate::monitor::MonitoringService;
use crate::observer::{ProcessController, ProcessObserver};
use crate::oracle::ProcessOracle;
use crate::platform::{ShellProcesses, SysinfoProcesses};

/// Keeps companion apps in step with the apps they accompany.
#[derive(Parser, Debug)]
#[command(name = "pairkiller-daemon", version, about)]
struct Cli {
    /// Config file to use instead of the per-user default.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Evaluate every group once and exit.
    #[arg(long)]
    once: bool,

    /// Launch the daemon at user login, then exit.
    #[arg(long, conflicts_with = "unregister_startup")]
    register_startup: bool,

    /// Remove the login entry, then exit.
    #[arg(long)]
    unregister_startup: bool,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run(Cli::parse()).await {
        error!(error = %format!("{e:#}"), "Daemon exited with an error");
        std::process::exit(1);
    }
}

fn init_logging() {
    let debug_enabled = env::var("PAIRKILLER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    if cli.register_startup {
        return startup::register_startup();
    }
    if cli.unregister_startup {
        return startup::unregister_startup();
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let (config_path, status_path) = match cli.config {
        Some(path) => {
            let path = paths::absolutize(&path)?;
            let status_path = path.with_file_name(paths::STATUS_FILE_NAME);
            (path, status_path)
        }
        None => {
            let app_dir = paths::app_data_dir()?;
            std::fs::create_dir_all(&app_dir).with_context(|| {
                format!("Failed to create app data directory {}", app_dir.display())
            })?;
            (paths::config_file_path()?, paths::status_file_path()?)
        }
    };
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), path = %config_path.display(), "Config error; using defaults");
        config::Config::default()
    });

    // ── Engine ────────────────────────────────────────────────────────────────
    let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingReporter);
    let shell = Arc::new(ShellProcesses::new());
    let oracle = Arc::new(ProcessOracle::new(
        Arc::clone(&shell) as Arc<dyn ProcessObserver>,
        Some(Arc::new(SysinfoProcesses::new()) as Arc<dyn ProcessObserver>),
        reporter,
        initial_config.monitoring.effective_cache_ttl(),
        initial_config.monitoring.effective_query_timeout(),
    ));
    let launcher = AppLauncher::new(Arc::clone(&oracle), shell as Arc<dyn ProcessController>);
    let evaluator = Arc::new(GroupEvaluator::new(Arc::clone(&oracle), launcher));
    let shared_config = Arc::new(RwLock::new(initial_config));
    let service = MonitoringService::new(shared_config, evaluator);

    if cli.once {
        if let Some(summary) = service.run_once().await {
            info!(
                evaluated = summary.evaluated,
                disabled = summary.disabled,
                changes = summary.changes,
                "Single pass finished"
            );
        }
        return Ok(());
    }

    // ── Initial status ────────────────────────────────────────────────────────
    let mut current_status = status::DaemonStatus::new();

    let (event_tx, mut event_rx) = mpsc::channel::<event::DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(event::DaemonEvent::Shutdown).await;
            }
        });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cache_ttl_ms = oracle.ttl().as_millis() as u64,
        "pairkiller-daemon started"
    );

    current_status.error = service.start().await.err().map(|e| e.to_string());
    current_status.update(service.is_monitoring(), service.group_count().await);
    status::write_status(&status_path, &current_status);

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            event::DaemonEvent::ConfigReloaded(new_config) => {
                info!(groups = new_config.app_groups.len(), "Config reloaded");
                current_status.error = service
                    .reconfigure(new_config)
                    .await
                    .err()
                    .map(|e| e.to_string());
                current_status.update(service.is_monitoring(), service.group_count().await);
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::Shutdown => {
                info!(passes = service.completed_cycles(), "Shutting down");
                service.stop_and_wait().await;
                current_status.error = None;
                current_status.update(false, service.group_count().await);
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }

    Ok(())
}
