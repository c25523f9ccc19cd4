/// Monitoring Scheduler.
///
/// [`MonitoringService`] owns the whole enable/disable lifecycle:
///
///   STOPPED --start()--> RUNNING --stop()--> STOPPED
///
/// `start()` runs one pass immediately, then spawns a fixed-delay timer task
/// that sleeps for the configured interval *after* each pass, so passes never
/// overlap.  A try-lock cycle gate additionally skips any pass that would
/// start while another is in flight (e.g. an immediate pass racing the tail
/// of a previous timer after a restart).
///
/// Cancellation is cooperative: `stop()` clears the running flag and wakes the
/// timer, which exits without starting another pass.  A pass already in
/// flight finishes the group it is evaluating and skips the remaining ones.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::evaluator::GroupEvaluator;

pub type SharedConfig = Arc<RwLock<Config>>;

/// Upper bound on how long `stop_and_wait` waits for an in-flight pass.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("cannot schedule the monitoring timer: {0}")]
    Timer(String),
}

/// Summary of one pass over all groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub evaluated: usize,
    pub disabled: usize,
    pub changes: usize,
    /// The pass stopped early because monitoring was stopped.
    pub interrupted: bool,
}

struct TimerHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the service and its timer task.
#[derive(Clone)]
struct CycleRunner {
    config: SharedConfig,
    evaluator: Arc<GroupEvaluator>,
    running: Arc<AtomicBool>,
    gate: Arc<tokio::sync::Mutex<()>>,
    completed: Arc<AtomicUsize>,
}

impl CycleRunner {
    /// Runs one pass unless another is in flight (`None`).
    async fn run_cycle(&self, respect_stop: bool) -> Option<CycleSummary> {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("Evaluation pass still in flight; skipping");
            return None;
        };

        // Snapshot: edits made while the pass runs apply to the next one.
        let groups = self.config.read().await.app_groups.clone();

        let mut summary = CycleSummary::default();
        for group in &groups {
            if respect_stop && !self.running.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }
            if !group.enabled {
                summary.disabled += 1;
                continue;
            }
            let report = self.evaluator.evaluate(group).await;
            summary.evaluated += 1;
            summary.changes += report.changes();
            debug!(
                group = %report.group,
                condition_met = report.condition_met,
                running = report.monitored.iter().filter(|(_, up)| *up).count(),
                changes = report.changes(),
                "Group evaluated"
            );
        }

        // A pass that outlived stop() may have cached answers after the
        // stop-time clear; a later start() must not read them.
        if respect_stop && !self.running.load(Ordering::SeqCst) {
            self.evaluator.oracle().clear_cache();
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        debug!(
            evaluated = summary.evaluated,
            disabled = summary.disabled,
            changes = summary.changes,
            interrupted = summary.interrupted,
            "Evaluation pass finished"
        );
        Some(summary)
    }

    async fn run_timer(self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                // Fires on stop() and when the sender is dropped.
                _ = stop_rx.changed() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.run_cycle(true).await;
        }
        debug!("Monitoring timer exited");
    }
}

pub struct MonitoringService {
    runner: CycleRunner,
    timer: Mutex<Option<TimerHandle>>,
}

impl MonitoringService {
    pub fn new(config: SharedConfig, evaluator: Arc<GroupEvaluator>) -> Self {
        Self {
            runner: CycleRunner {
                config,
                evaluator,
                running: Arc::new(AtomicBool::new(false)),
                gate: Arc::new(tokio::sync::Mutex::new(())),
                completed: Arc::new(AtomicUsize::new(0)),
            },
            timer: Mutex::new(None),
        }
    }

    /// Starts monitoring.  No-op when already running or when monitoring is
    /// disabled in the configuration.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let (enabled, interval) = {
            let config = self.runner.config.read().await;
            (
                config.monitoring.enabled,
                config.monitoring.effective_interval(),
            )
        };
        if !enabled {
            info!("Monitoring is disabled in the configuration");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MonitorError::Timer(e.to_string()))?;

        if self
            .runner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        info!(interval_ms = interval.as_millis() as u64, "Monitoring started");
        self.runner.evaluator.oracle().clear_cache();

        // Reflect reality right away instead of after the first interval.
        self.runner.run_cycle(true).await;
        if !self.is_monitoring() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = runtime.spawn(self.runner.clone().run_timer(interval, stop_rx));
        let previous = self
            .lock_timer()
            .replace(TimerHandle { stop_tx, handle });
        if let Some(previous) = previous {
            let _ = previous.stop_tx.send(true);
        }
        Ok(())
    }

    /// Stops monitoring and clears the process cache.  The timer is told to
    /// exit; a pass already in flight is allowed to finish.
    pub fn stop(&self) {
        let _ = self.halt();
    }

    /// Like [`stop`](Self::stop), then waits (bounded) for the in-flight pass.
    pub async fn stop_and_wait(&self) {
        let Some(handle) = self.halt() else {
            return;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("Timed out waiting for the in-flight evaluation pass");
        }
        // The drained pass may have cached fresh answers; drop them too.
        self.runner.evaluator.oracle().clear_cache();
    }

    /// Applies a new configuration as stop-then-start.
    pub async fn reconfigure(&self, config: Config) -> Result<(), MonitorError> {
        self.stop_and_wait().await;
        self.runner.evaluator.oracle().set_timing(
            config.monitoring.effective_cache_ttl(),
            config.monitoring.effective_query_timeout(),
        );
        *self.runner.config.write().await = config;
        self.start().await
    }

    /// One pass over all groups regardless of the running state.
    pub async fn run_once(&self) -> Option<CycleSummary> {
        self.runner.run_cycle(false).await
    }

    pub fn is_monitoring(&self) -> bool {
        self.runner.running.load(Ordering::SeqCst)
    }

    pub async fn group_count(&self) -> usize {
        self.runner.config.read().await.app_groups.len()
    }

    /// Number of passes that have run to completion (or early stop).
    pub fn completed_cycles(&self) -> usize {
        self.runner.completed.load(Ordering::SeqCst)
    }

    fn halt(&self) -> Option<JoinHandle<()>> {
        if !self.runner.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        let timer = self.lock_timer().take();
        self.runner.evaluator.oracle().clear_cache();
        info!("Monitoring stopped");

        timer.map(|timer| {
            let _ = timer.stop_tx.send(true);
            timer.handle
        })
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<TimerHandle>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MonitoringService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Action, AppGroup, Condition};
    use crate::error::ErrorReporter;
    use crate::launcher::AppLauncher;
    use crate::observer::{ProcessController, ProcessObserver};
    use crate::oracle::ProcessOracle;
    use crate::testing::{controlled, group, touch, unexpected, FakeProcesses, RecordingReporter};

    fn service(
        fake: &Arc<FakeProcesses>,
        reporter: &Arc<RecordingReporter>,
        groups: Vec<AppGroup>,
        interval_ms: u64,
    ) -> Arc<MonitoringService> {
        let mut config = Config::default();
        config.monitoring.interval = interval_ms;
        config.app_groups = groups;

        let oracle = Arc::new(ProcessOracle::new(
            Arc::clone(fake) as Arc<dyn ProcessObserver>,
            None,
            Arc::clone(reporter) as Arc<dyn ErrorReporter>,
            Duration::from_secs(2),
            Duration::from_secs(4),
        ));
        let launcher = AppLauncher::new(
            Arc::clone(&oracle),
            Arc::clone(fake) as Arc<dyn ProcessController>,
        );
        let evaluator = Arc::new(GroupEvaluator::new(oracle, launcher));
        Arc::new(MonitoringService::new(
            Arc::new(RwLock::new(config)),
            evaluator,
        ))
    }

    fn watch_only(name: &str, app: &str) -> AppGroup {
        group(name, Condition::Any, &[app], vec![])
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_runs_immediately_and_stop_is_idempotent() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);

        assert!(!svc.is_monitoring());
        svc.stop();
        assert!(!svc.is_monitoring());

        svc.start().await.unwrap();
        assert!(svc.is_monitoring());
        assert_eq!(svc.completed_cycles(), 1);
        assert_eq!(fake.queries(), 1);

        // Second start is a no-op: no extra immediate pass.
        svc.start().await.unwrap();
        assert_eq!(svc.completed_cycles(), 1);

        svc.stop();
        assert!(!svc.is_monitoring());
        svc.stop();
        assert!(!svc.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_evaluating_at_interval() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);

        svc.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(7_600)).await;
        assert_eq!(svc.completed_cycles(), 4);
        svc.stop_and_wait().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(svc.completed_cycles(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_monitoring_does_not_start() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);
        svc.runner.config.write().await.monitoring.enabled = false;

        svc.start().await.unwrap();
        assert!(!svc.is_monitoring());
        assert_eq!(fake.queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_process_cache() {
        let fake = FakeProcesses::with_running(&["Game.exe"]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);

        svc.start().await.unwrap();
        assert_eq!(svc.runner.evaluator.oracle().cached_len(), 1);
        svc.stop();
        assert_eq!(svc.runner.evaluator.oracle().cached_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn group_count_and_disabled_groups() {
        let fake = FakeProcesses::with_running(&[]);
        let mut off = watch_only("off", "Other.exe");
        off.enabled = false;
        let svc = service(
            &fake,
            &Arc::default(),
            vec![watch_only("on", "Game.exe"), off],
            2_500,
        );

        assert_eq!(svc.group_count().await, 2);
        let summary = svc.run_once().await.unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.disabled, 1);
        assert_eq!(fake.queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_config_runs_without_error() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![], 2_500);
        svc.start().await.unwrap();
        assert!(svc.is_monitoring());
        assert_eq!(svc.group_count().await, 0);
        svc.stop();
    }

    #[test]
    fn start_without_runtime_is_a_timer_fault() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![], 2_500);
        let result = poll_outside_runtime(svc.start());
        assert!(matches!(result, Err(MonitorError::Timer(_))));
        assert!(!svc.is_monitoring());
    }

    /// Busy-polls `future` on the current thread, which has no tokio runtime.
    fn poll_outside_runtime<F: std::future::Future>(future: F) -> F::Output {
        use std::task::{Context, Poll, Waker};

        let mut cx = Context::from_waker(Waker::noop());
        let mut future = std::pin::pin!(future);
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
        }
    }

    // ── concurrency ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn slow_cycles_never_overlap() {
        let fake = FakeProcesses::with_running(&[]);
        // Each pass takes 3s against a 1s interval.
        fake.set_query_delay(Duration::from_secs(3));
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 1_000);

        svc.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        svc.stop_and_wait().await;

        assert_eq!(fake.max_in_flight(), 1);
        assert!(svc.completed_cycles() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pass_is_skipped_while_another_is_in_flight() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);

        let _held = svc.runner.gate.lock().await;
        assert_eq!(svc.run_once().await, None);
        assert_eq!(fake.queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_cycle_finishes_in_flight_group_only() {
        let fake = FakeProcesses::with_running(&[]);
        fake.set_query_delay(Duration::from_secs(1));
        let groups = (0..10)
            .map(|i| watch_only(&format!("g{i}"), &format!("App{i}.exe")))
            .collect();
        let svc = service(&fake, &Arc::default(), groups, 10_000);

        let starter = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.start().await })
        };
        // Groups take 1s each; at 2.5s the third group is in flight.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        svc.stop();
        starter.await.unwrap().unwrap();

        assert_eq!(fake.queries(), 3);
        assert!(!svc.is_monitoring());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.queries(), 3);
        assert_eq!(svc.completed_cycles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_mid_pass_queries_afresh() {
        let fake = FakeProcesses::with_running(&["Game.exe"]);
        fake.set_query_delay(Duration::from_secs(1));
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);

        let starter = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.start().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        svc.stop();
        starter.await.unwrap().unwrap();
        // The drained pass answered "running" after the stop-time clear.
        assert_eq!(svc.runner.evaluator.oracle().cached_len(), 0);

        fake.set_running("Game.exe", false);
        fake.set_query_delay(Duration::ZERO);
        svc.start().await.unwrap();
        assert_eq!(fake.queries(), 2);
        assert!(svc.is_monitoring());
        svc.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_in_one_group_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let x = touch(dir.path(), "X.exe");
        let y = touch(dir.path(), "Y.exe");
        let z = touch(dir.path(), "Z.exe");
        let fake = FakeProcesses::with_running(&["Game.exe"]);
        fake.fail_launches("X.exe", unexpected);
        let reporter = Arc::new(RecordingReporter::default());
        let groups = vec![
            group(
                "G",
                Condition::Any,
                &["Game.exe"],
                vec![controlled(&x, Action::Sync), controlled(&y, Action::Sync)],
            ),
            group(
                "G2",
                Condition::Any,
                &["Game.exe"],
                vec![controlled(&z, Action::Start)],
            ),
        ];
        let svc = service(&fake, &reporter, groups, 2_500);

        let summary = svc.run_once().await.unwrap();
        assert_eq!(summary.evaluated, 2);
        assert_eq!(
            fake.launches(),
            vec!["X.exe".to_string(), "Y.exe".to_string(), "Z.exe".to_string()]
        );
        assert_eq!(reporter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_swaps_groups_between_passes() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("old", "Old.exe")], 2_500);
        svc.start().await.unwrap();

        let mut next = Config::default();
        next.app_groups = vec![watch_only("a", "A.exe"), watch_only("b", "B.exe")];
        svc.reconfigure(next).await.unwrap();

        assert!(svc.is_monitoring());
        assert_eq!(svc.group_count().await, 2);
        // One pass over the old group, one immediate pass over the new ones.
        assert_eq!(fake.queries(), 3);
        svc.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_to_disabled_leaves_monitoring_stopped() {
        let fake = FakeProcesses::with_running(&[]);
        let svc = service(&fake, &Arc::default(), vec![watch_only("g", "Game.exe")], 2_500);
        svc.start().await.unwrap();

        let mut next = Config::default();
        next.monitoring.enabled = false;
        svc.reconfigure(next).await.unwrap();
        assert!(!svc.is_monitoring());
    }
}
