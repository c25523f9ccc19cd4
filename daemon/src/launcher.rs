/// App Launcher/Terminator.
///
/// Both operations are idempotent: they consult the oracle first and do
/// nothing when the target state already holds.  Launches are
/// fire-and-forget; the child is only observed again through later polls.
/// Failures are classified and resolved here, so callers only ever see an
/// [`ActionOutcome`].
use std::path::Path;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{self, ErrorReporter, ProcessError, Severity};
use crate::observer::{process_name_from_path, ProcessController};
use crate::oracle::ProcessOracle;

/// What a single launch or stop request ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The target state already held; nothing was done.
    Unchanged,
    Launched,
    Stopped,
    /// Configuration problem (empty or missing path); nothing was attempted.
    Skipped(String),
    /// The OS call failed; the error has already been logged/reported.
    Failed(String),
}

pub struct AppLauncher {
    oracle: Arc<ProcessOracle>,
    controller: Arc<dyn ProcessController>,
    reporter: Arc<dyn ErrorReporter>,
}

impl AppLauncher {
    pub fn new(oracle: Arc<ProcessOracle>, controller: Arc<dyn ProcessController>) -> Self {
        let reporter = oracle.reporter();
        Self {
            oracle,
            controller,
            reporter,
        }
    }

    /// Starts the app at `app_path` unless a process with its basename is running.
    pub async fn ensure_running(&self, app_path: &str) -> ActionOutcome {
        let Some(name) = process_name_from_path(app_path) else {
            debug!("Launch skipped: no path configured");
            return ActionOutcome::Skipped("no launch path configured".into());
        };

        if self.oracle.is_running(&name).await {
            return ActionOutcome::Unchanged;
        }

        let path = Path::new(app_path.trim());
        if !path.exists() {
            info!(path = %path.display(), "Launch skipped: file does not exist");
            return ActionOutcome::Skipped(format!("{} does not exist", path.display()));
        }

        let result = match timeout(self.oracle.query_timeout(), self.controller.launch(path)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout {
                operation: "launch",
                target: name.clone(),
                elapsed: self.oracle.query_timeout(),
            }),
        };
        // Whatever happened, the cached answer for this name is now stale.
        self.oracle.invalidate(&name);

        match result {
            Ok(()) => {
                info!(process = %name, path = %path.display(), "Launched");
                ActionOutcome::Launched
            }
            Err(err) => {
                let message = err.to_string();
                error::handle(
                    self.reporter.as_ref(),
                    &err,
                    &[("process", name), ("action", "launch".into())],
                    Severity::Error,
                );
                ActionOutcome::Failed(message)
            }
        }
    }

    /// Forcefully terminates `process_name` if it is running.
    pub async fn stop(&self, process_name: &str) -> ActionOutcome {
        if !self.oracle.is_running(process_name).await {
            return ActionOutcome::Unchanged;
        }

        let result = match timeout(
            self.oracle.query_timeout(),
            self.controller.terminate(process_name),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout {
                operation: "stop",
                target: process_name.to_string(),
                elapsed: self.oracle.query_timeout(),
            }),
        };
        self.oracle.invalidate(process_name);

        match result {
            Ok(()) => {
                info!(process = process_name, "Stopped");
                ActionOutcome::Stopped
            }
            // Already gone: the target state holds.
            Err(ProcessError::NoSuchProcess(_)) => {
                debug!(process = process_name, "Stop found no such process");
                ActionOutcome::Stopped
            }
            Err(err) => {
                let message = err.to_string();
                error::handle(
                    self.reporter.as_ref(),
                    &err,
                    &[
                        ("process", process_name.to_string()),
                        ("action", "stop".into()),
                    ],
                    Severity::Warning,
                );
                ActionOutcome::Failed(message)
            }
        }
    }
}
