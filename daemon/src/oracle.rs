/// Process Existence Oracle: "is a process named X running?".
///
/// Answers are cached per (case-insensitive) name for a short TTL so several
/// groups referencing the same process cost one OS query per window.  Every
/// query is bounded by a timeout; a timeout reads as "not running".  When the
/// primary backend errors for any other reason the fallback backend is asked
/// instead; an unexpected primary error is still reported.  [`ProcessOracle::is_running`] never fails: errors are classified
/// and resolved to `false`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::{self, ErrorReporter, ProcessError, Severity};
use crate::observer::{normalize_name, ProcessObserver};

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    running: bool,
    timestamp: Instant,
}

pub struct ProcessOracle {
    primary: Arc<dyn ProcessObserver>,
    fallback: Option<Arc<dyn ProcessObserver>>,
    reporter: Arc<dyn ErrorReporter>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl_ms: AtomicU64,
    query_timeout_ms: AtomicU64,
}

impl ProcessOracle {
    pub fn new(
        primary: Arc<dyn ProcessObserver>,
        fallback: Option<Arc<dyn ProcessObserver>>,
        reporter: Arc<dyn ErrorReporter>,
        ttl: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            reporter,
            cache: Mutex::new(HashMap::new()),
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            query_timeout_ms: AtomicU64::new(query_timeout.as_millis() as u64),
        }
    }

    /// Replaces the cache TTL and query timeout; applied between passes.
    pub fn set_timing(&self, ttl: Duration, query_timeout: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
        self.query_timeout_ms
            .store(query_timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::clone(&self.reporter)
    }

    /// Returns whether `name` is running, serving from the cache when fresh.
    pub async fn is_running(&self, name: &str) -> bool {
        let key = normalize_name(name);
        if key.is_empty() {
            return false;
        }
        if let Some(running) = self.cached(&key) {
            return running;
        }

        let running = self.query(name).await;
        self.store(key, running);
        running
    }

    /// Drops the cached answer for `name` so the next call re-queries.
    pub fn invalidate(&self, name: &str) {
        self.lock_cache().remove(&normalize_name(name));
    }

    /// Drops every cached answer.
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    #[cfg(test)]
    pub fn cached_len(&self) -> usize {
        self.lock_cache().len()
    }

    fn cached(&self, key: &str) -> Option<bool> {
        let cache = self.lock_cache();
        let entry = cache.get(key)?;
        (entry.timestamp.elapsed() < self.ttl()).then_some(entry.running)
    }

    fn store(&self, key: String, running: bool) {
        self.lock_cache().insert(
            key,
            CacheEntry {
                running,
                timestamp: Instant::now(),
            },
        );
    }

    /// A poisoned cache only ever holds booleans; keep using it.
    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn query(&self, name: &str) -> bool {
        let err = match self.query_with(self.primary.as_ref(), name).await {
            Ok(running) => return running,
            Err(err) => err,
        };

        if err.is_timeout() {
            debug!(process = name, error = %err, "Process query timed out");
            return false;
        }

        let Some(fallback) = &self.fallback else {
            self.resolve(&err, name);
            return false;
        };

        if err.is_environmental() {
            debug!(process = name, error = %err, "Primary process query failed; using fallback");
        } else {
            self.resolve(&err, name);
        }
        match self.query_with(fallback.as_ref(), name).await {
            Ok(running) => running,
            Err(fallback_err) => {
                self.resolve(&fallback_err, name);
                false
            }
        }
    }

    async fn query_with(
        &self,
        observer: &dyn ProcessObserver,
        name: &str,
    ) -> Result<bool, ProcessError> {
        let limit = self.query_timeout();
        match timeout(limit, observer.is_running(name)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout {
                operation: "query",
                target: name.to_string(),
                elapsed: limit,
            }),
        }
    }

    fn resolve(&self, err: &ProcessError, name: &str) {
        error::handle(
            self.reporter.as_ref(),
            err,
            &[("process", name.to_string()), ("action", "query".to_string())],
            Severity::Error,
        );
    }
}
