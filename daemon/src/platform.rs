/// Concrete process-layer backends.
///
/// [`ShellProcesses`] drives the platform's own tools and is the primary
/// backend for queries, starts and stops:
///   - Windows: `tasklist /nh /fi "imagename eq X"`, direct execution,
///     `taskkill /im X /f`.
///   - POSIX: `pgrep -i -x <stem>`, `open` for macOS `.app` bundles or a
///     detached spawn otherwise, `pkill -KILL -i -x <stem>`.  Both match the
///     process name only; command lines (including those of concurrent
///     `pgrep` runs and of the daemon itself) are never searched.
///
/// [`SysinfoProcesses`] enumerates the process table through `sysinfo` and is
/// used as the fallback query when the primary tool errors (e.g. `pgrep` is
/// not installed in a minimal environment).
///
/// Neither backend applies its own deadline; callers wrap every call in
/// `tokio::time::timeout`.  Children are spawned with `kill_on_drop` so a
/// query abandoned by its timeout does not linger.
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::Command;

use crate::error::ProcessError;
use crate::observer::{name_matches, ProcessController, ProcessObserver};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Primary backend built on the platform's command-line process tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellProcesses;

impl ShellProcesses {
    pub fn new() -> Self {
        Self
    }
}

/// Builds a quiet command: no console window, no inherited stdio.
fn quiet(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

/// Anchored by `-x`; escaped because `pgrep`/`pkill` treat it as a regex.
#[cfg(not(windows))]
fn posix_pattern(name: &str) -> String {
    let stem = crate::observer::process_stem(name);
    // The kernel truncates names, so an exact match must use the truncated form.
    #[cfg(target_os = "linux")]
    let stem: String = stem
        .chars()
        .take(crate::observer::LINUX_COMM_LEN)
        .collect();
    regex::escape(&stem)
}

/// Whether `tasklist /fo csv` output lists an image named `name`.  The CSV
/// form is used because the table form cuts image names at 25 characters.
#[cfg_attr(not(windows), allow(dead_code))]
fn csv_lists_image(stdout: &str, name: &str) -> bool {
    let wanted = name.trim();
    !wanted.is_empty()
        && stdout.lines().any(|line| {
            line.trim()
                .strip_prefix('"')
                .and_then(|rest| rest.split('"').next())
                .is_some_and(|image| image.eq_ignore_ascii_case(wanted))
        })
}

#[async_trait]
impl ProcessObserver for ShellProcesses {
    #[cfg(windows)]
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError> {
        let output = quiet("tasklist")
            .args(["/nh", "/fo", "csv", "/fi", &format!("imagename eq {}", name.trim())])
            .output()
            .await
            .map_err(|e| ProcessError::from_io("tasklist", name, e))?;

        if !output.status.success() {
            return Err(ProcessError::CommandFailed {
                command: "tasklist".into(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // With no match tasklist prints an unquoted INFO line and still exits 0.
        Ok(csv_lists_image(&String::from_utf8_lossy(&output.stdout), name))
    }

    #[cfg(not(windows))]
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError> {
        let output = quiet("pgrep")
            .args(["-i", "-x", &posix_pattern(name)])
            .stdout(Stdio::null())
            .output()
            .await
            .map_err(|e| ProcessError::from_io("pgrep", name, e))?;

        // pgrep: 0 = matched, 1 = nothing matched, anything else = error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(ProcessError::CommandFailed {
                command: "pgrep".into(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

#[async_trait]
impl ProcessController for ShellProcesses {
    async fn launch(&self, path: &Path) -> Result<(), ProcessError> {
        let target = path.display().to_string();

        // macOS bundles are directories; hand them to `open` and wait for it.
        if cfg!(target_os = "macos") && path.extension().is_some_and(|e| e == "app") {
            let output = quiet("open")
                .arg(path)
                .output()
                .await
                .map_err(|e| ProcessError::from_io("open", &target, e))?;
            if !output.status.success() {
                return Err(ProcessError::CommandFailed {
                    command: format!("open {target}"),
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            return Ok(());
        }

        let mut cmd = Command::new(path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        // Dropping the child detaches it; we only observe it through later polls.
        cmd.spawn()
            .map(|_child| ())
            .map_err(|source| ProcessError::Spawn { target, source })
    }

    #[cfg(windows)]
    async fn terminate(&self, name: &str) -> Result<(), ProcessError> {
        let output = quiet("taskkill")
            .args(["/im", name.trim(), "/f"])
            .output()
            .await
            .map_err(|e| ProcessError::from_io("taskkill", name, e))?;
        match output.status.code() {
            Some(0) => Ok(()),
            // 128: "The process ... not found."
            Some(128) => Err(ProcessError::NoSuchProcess(name.to_string())),
            code => Err(ProcessError::CommandFailed {
                command: "taskkill".into(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    #[cfg(not(windows))]
    async fn terminate(&self, name: &str) -> Result<(), ProcessError> {
        let output = quiet("pkill")
            .args(["-KILL", "-i", "-x", &posix_pattern(name)])
            .output()
            .await
            .map_err(|e| ProcessError::from_io("pkill", name, e))?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => Err(ProcessError::NoSuchProcess(name.to_string())),
            code => Err(ProcessError::CommandFailed {
                command: "pkill".into(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

/// Fallback query backend that scans the full process table via `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcesses;

impl SysinfoProcesses {
    pub fn new() -> Self {
        Self
    }
}

/// Scans a freshly refreshed process table for `name`.
fn scan_process_table(name: &str) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes().values().any(|p| {
        let image = p.name().to_string_lossy();
        if name_matches(&image, name) {
            return true;
        }
        p.exe()
            .and_then(|exe| exe.file_name())
            .is_some_and(|file| name_matches(&file.to_string_lossy(), name))
    })
}

#[async_trait]
impl ProcessObserver for SysinfoProcesses {
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError> {
        let wanted = name.to_string();
        // Refreshing the process table is blocking work.
        tokio::task::spawn_blocking(move || scan_process_table(&wanted))
            .await
            .map_err(|e| ProcessError::Task {
                target: name.to_string(),
                details: e.to_string(),
            })
    }
}
