/// Uniform interface to the OS process layer.
///
/// The oracle, launcher and evaluator only ever talk to these traits, so they
/// stay platform-agnostic and can be driven by a scripted fake in tests.
///
/// Name matching is case-insensitive everywhere and always compares process
/// names, never command lines:
///   - Windows: the image name must equal the wanted name (`Game.exe`).
///   - POSIX: a trailing `.exe` is stripped from both sides and the stems must
///     be equal.  Linux reports at most 15 characters of a process name, so a
///     15-character name also matches any wanted stem it is a prefix of.
///
/// The same rule backs both the existence query and the launcher's
/// "already running" check, since the launcher asks the oracle.
use std::path::Path;

use async_trait::async_trait;

use crate::error::ProcessError;

/// Longest process name the Linux kernel reports (`TASK_COMM_LEN - 1`).
pub const LINUX_COMM_LEN: usize = 15;

/// Answers "is a process with this name running right now?".
#[async_trait]
pub trait ProcessObserver: Send + Sync {
    /// `Ok(false)` means the query worked and nothing matched.
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError>;
}

/// Starts and terminates processes.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Starts the executable (or app bundle) at `path`, fire-and-forget.
    async fn launch(&self, path: &Path) -> Result<(), ProcessError>;

    /// Forcefully terminates every process matching `name`.
    /// Returns [`ProcessError::NoSuchProcess`] when nothing matched.
    async fn terminate(&self, name: &str) -> Result<(), ProcessError>;
}

/// Cache/lookup key for a process name.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Strips the Windows `.exe` suffix so POSIX patterns match native binaries.
pub fn process_stem(name: &str) -> &str {
    let trimmed = name.trim();
    let len = trimmed.len();
    if len > 4 && trimmed.is_char_boundary(len - 4) && trimmed[len - 4..].eq_ignore_ascii_case(".exe") {
        &trimmed[..len - 4]
    } else {
        trimmed
    }
}

/// Resolves the process image name from a launch path (its basename).
pub fn process_name_from_path(path: &str) -> Option<String> {
    Path::new(path.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Windows rule: case-insensitive equality of image names.
pub fn matches_exact(candidate: &str, wanted: &str) -> bool {
    !wanted.trim().is_empty() && candidate.trim().eq_ignore_ascii_case(wanted.trim())
}

/// POSIX rule: case-insensitive equality of stems, allowing for the kernel's
/// truncated process names.
pub fn matches_stem(candidate: &str, wanted: &str) -> bool {
    let wanted = process_stem(wanted).to_lowercase();
    let candidate = process_stem(candidate).to_lowercase();
    if wanted.is_empty() {
        return false;
    }
    candidate == wanted
        || (candidate.chars().count() == LINUX_COMM_LEN && wanted.starts_with(&candidate))
}

/// Applies the rule for the platform this binary was built for.
pub fn name_matches(candidate: &str, wanted: &str) -> bool {
    if cfg!(windows) {
        matches_exact(candidate, wanted)
    } else {
        matches_stem(candidate, wanted)
    }
}
