/// Failure taxonomy for the OS process layer and the error-reporting sink.
///
/// Every failure coming out of a process query, start, or stop is a
/// [`ProcessError`].  Callers never propagate these past the group evaluator;
/// instead they pass them to [`handle`], which splits them into
/// *environmental* noise (debug-logged only) and *unexpected* faults
/// (logged and forwarded to the [`ErrorReporter`]).
use std::io;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{operation} for '{target}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        elapsed: Duration,
    },

    #[error("permission denied while {operation} '{target}'")]
    PermissionDenied {
        operation: &'static str,
        target: String,
    },

    #[error("no such process: {0}")]
    NoSuchProcess(String),

    /// The external tool backing a query (e.g. `pgrep`, `tasklist`) is missing.
    #[error("process tool '{0}' is not available")]
    ToolUnavailable(&'static str),

    #[error("failed to start '{target}': {source}")]
    Spawn {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("background task for '{target}' failed: {details}")]
    Task { target: String, details: String },
}

impl ProcessError {
    /// `true` for expected, frequent failures that never reach the reporter:
    /// timeouts, permission problems, and anything meaning "not there".
    pub fn is_environmental(&self) -> bool {
        match self {
            ProcessError::Timeout { .. }
            | ProcessError::PermissionDenied { .. }
            | ProcessError::NoSuchProcess(_)
            | ProcessError::ToolUnavailable(_) => true,
            ProcessError::Spawn { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::AlreadyExists
            ),
            ProcessError::CommandFailed { stderr, .. } => is_environmental_message(stderr),
            ProcessError::Task { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    /// Converts an io error raised while running `command` against `target`.
    pub fn from_io(command: &'static str, target: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ProcessError::ToolUnavailable(command),
            io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
                operation: command,
                target: target.to_string(),
            },
            _ => ProcessError::Spawn {
                target: target.to_string(),
                source: err,
            },
        }
    }
}

/// Message fragments emitted by `taskkill`, `pkill` and friends for
/// routine "nothing to do" or "not allowed" outcomes.
const ENVIRONMENTAL_PATTERNS: &[&str] = &[
    "not found",
    "no such process",
    "no tasks are running",
    "access is denied",
    "operation not permitted",
    "permission denied",
];

fn is_environmental_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ENVIRONMENTAL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// How loudly the reporting collaborator should treat a forwarded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Sink for unexpected failures (crash/telemetry reporting lives behind it).
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &ProcessError, tags: &[(&'static str, String)], severity: Severity);
}

/// Default reporter: emits one `error`-level event on the `pairkiller::report` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &ProcessError, tags: &[(&'static str, String)], severity: Severity) {
        let tags = tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::error!(
            target: "pairkiller::report",
            error = %error,
            ?severity,
            tags = %tags,
            "Unexpected process failure"
        );
    }
}

/// Classifies `error` and either debug-logs it or logs and forwards it.
///
/// `tags` should carry enough context to diagnose the failure: the process
/// name and the action that was attempted.  The platform tag is appended here.
pub fn handle(
    reporter: &dyn ErrorReporter,
    error: &ProcessError,
    tags: &[(&'static str, String)],
    severity: Severity,
) {
    if error.is_environmental() {
        debug!(error = %error, "Environmental process failure");
        return;
    }
    warn!(error = %error, "Unexpected process failure");
    let mut tags = tags.to_vec();
    tags.push(("platform", std::env::consts::OS.to_string()));
    reporter.report(error, &tags, severity);
}
