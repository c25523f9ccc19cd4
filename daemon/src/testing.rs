/// Scripted process layer and recording reporter shared by the unit tests.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Action, AppGroup, AppRef, Condition, ControlledApp};
use crate::error::{ErrorReporter, ProcessError, Severity};
use crate::observer::{normalize_name, ProcessController, ProcessObserver};

type ErrorFactory = fn(&str) -> ProcessError;

/// In-memory process table.  Launching a path adds its basename to the table,
/// terminating removes the name, and every call is counted.
#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<HashSet<String>>,
    queries: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    query_delay: Mutex<Duration>,
    action_delay: Mutex<Duration>,
    query_failures: Mutex<HashMap<String, ErrorFactory>>,
    launch_failures: Mutex<HashMap<String, ErrorFactory>>,
    terminate_failures: Mutex<HashMap<String, ErrorFactory>>,
    launches: Mutex<Vec<String>>,
    terminations: Mutex<Vec<String>>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeProcesses {
    pub fn with_running(names: &[&str]) -> Arc<Self> {
        let fake = Self::default();
        for name in names {
            fake.set_running(name, true);
        }
        Arc::new(fake)
    }

    pub fn set_running(&self, name: &str, running: bool) {
        let mut table = self.running.lock().unwrap();
        if running {
            table.insert(normalize_name(name));
        } else {
            table.remove(&normalize_name(name));
        }
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains(&normalize_name(name))
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }

    /// Makes every launch and termination take `delay` before acting.
    pub fn set_action_delay(&self, delay: Duration) {
        *self.action_delay.lock().unwrap() = delay;
    }

    pub fn fail_queries(&self, name: &str, make: ErrorFactory) {
        self.query_failures
            .lock()
            .unwrap()
            .insert(normalize_name(name), make);
    }

    pub fn fail_launches(&self, name: &str, make: ErrorFactory) {
        self.launch_failures
            .lock()
            .unwrap()
            .insert(normalize_name(name), make);
    }

    pub fn fail_terminations(&self, name: &str, make: ErrorFactory) {
        self.terminate_failures
            .lock()
            .unwrap()
            .insert(normalize_name(name), make);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn act_after_delay(&self) {
        let delay = *self.action_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Basenames of every launch attempt, including failed ones.
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    /// Names of every termination attempt, including failed ones.
    pub fn terminations(&self) -> Vec<String> {
        self.terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessObserver for FakeProcesses {
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        let delay = *self.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let key = normalize_name(name);
        let failure = self.query_failures.lock().unwrap().get(&key).copied();
        if let Some(make) = failure {
            return Err(make(name));
        }
        Ok(self.running.lock().unwrap().contains(&key))
    }
}

#[async_trait]
impl ProcessController for FakeProcesses {
    async fn launch(&self, path: &Path) -> Result<(), ProcessError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.launches.lock().unwrap().push(name.clone());
        self.act_after_delay().await;
        let failure = self
            .launch_failures
            .lock()
            .unwrap()
            .get(&normalize_name(&name))
            .copied();
        if let Some(make) = failure {
            return Err(make(&name));
        }
        self.set_running(&name, true);
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), ProcessError> {
        self.terminations.lock().unwrap().push(name.to_string());
        self.act_after_delay().await;
        let failure = self
            .terminate_failures
            .lock()
            .unwrap()
            .get(&normalize_name(name))
            .copied();
        if let Some(make) = failure {
            return Err(make(name));
        }
        if !self.running.lock().unwrap().remove(&normalize_name(name)) {
            return Err(ProcessError::NoSuchProcess(name.to_string()));
        }
        Ok(())
    }
}

pub fn unexpected(target: &str) -> ProcessError {
    ProcessError::Spawn {
        target: target.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
    }
}

pub fn denied(target: &str) -> ProcessError {
    ProcessError::PermissionDenied {
        operation: "query",
        target: target.to_string(),
    }
}

pub fn tool_missing(_target: &str) -> ProcessError {
    ProcessError::ToolUnavailable("pgrep")
}

/// Collects every forwarded report.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, Vec<(&'static str, String)>, Severity)>>,
}

impl RecordingReporter {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<(String, Vec<(&'static str, String)>, Severity)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &ProcessError, tags: &[(&'static str, String)], severity: Severity) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), tags.to_vec(), severity));
    }
}

/// Creates an empty file named `name` inside `dir` and returns its path.
pub fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"").unwrap();
    path
}

pub fn group(
    name: &str,
    condition: Condition,
    monitored: &[&str],
    controlled: Vec<ControlledApp>,
) -> AppGroup {
    AppGroup {
        name: name.to_string(),
        enabled: true,
        condition,
        reverse: false,
        monitored_apps: monitored
            .iter()
            .map(|n| AppRef {
                name: n.to_string(),
            })
            .collect(),
        controlled_apps: controlled,
    }
}

pub fn controlled(path: &Path, action: Action) -> ControlledApp {
    ControlledApp {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_string_lossy().into_owned(),
        action,
    }
}
