//! Background refresh scheduling
//!
//! Refreshes run on a small dedicated rayon pool so they never compete with
//! the simulation's global pool. Each keyed record carries an `InFlight` flag;
//! a request while the previous task is still running is dropped.
//!
//! Keys that asked for a refresh during a rebalance window get their next due
//! times spread evenly across one refresh interval when the window closes, so
//! rebuilds do not bunch up on the same tick.

use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::error;

use crate::metrics::Metrics;

/// Failure to start the refresh workers
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to build refresh pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// At-most-one-task guard for a record
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    /// Claim the slot; false when a task is already running
    #[inline]
    pub fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn finish(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Keys seen during one rebalance window, in arrival order
#[derive(Debug)]
pub struct StaggerWindow<K> {
    period: Duration,
    window_start: Instant,
    arrivals: Vec<K>,
    seen: FxHashSet<K>,
}

impl<K: Copy + Eq + Hash> StaggerWindow<K> {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            window_start: now,
            arrivals: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Note a refresh request for `key`
    pub fn register(&mut self, key: K) {
        if self.seen.insert(key) {
            self.arrivals.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    /// Close the window once its period has elapsed.
    ///
    /// Returns each registered key with its next due time,
    /// `now + i * (interval / count)`, and starts a new window at `now`.
    pub fn rebalance(&mut self, now: Instant, interval: Duration) -> Option<Vec<(K, Instant)>> {
        if now.saturating_duration_since(self.window_start) < self.period {
            return None;
        }
        self.window_start = now;
        self.seen.clear();
        let keys = std::mem::take(&mut self.arrivals);
        if keys.is_empty() {
            return Some(Vec::new());
        }

        let step = interval / keys.len() as u32;
        Some(
            keys.into_iter()
                .enumerate()
                .map(|(i, key)| (key, now + step * i as u32))
                .collect(),
        )
    }
}

/// Dedicated worker pool plus outstanding-task accounting
pub struct RefreshScheduler {
    pool: rayon::ThreadPool,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
    metrics: Arc<Metrics>,
}

impl RefreshScheduler {
    pub fn new(threads: usize, metrics: Arc<Metrics>) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("visibility-refresh-{}", i))
            .build()?;
        Ok(Self {
            pool,
            outstanding: Arc::new((Mutex::new(0), Condvar::new())),
            metrics,
        })
    }

    /// Run `job` in the background unless `guard` shows one already running.
    ///
    /// A panicking job is logged and counted; the guard is released either way.
    pub fn submit<F>(&self, guard: Arc<InFlight>, label: &'static str, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !guard.try_begin() {
            return false;
        }

        *self.outstanding.0.lock() += 1;
        let outstanding = self.outstanding.clone();
        let metrics = self.metrics.clone();

        self.pool.spawn(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Visibility {} refresh failed: {}", label, msg);
                metrics.refresh_failures.fetch_add(1, Ordering::Relaxed);
            }
            guard.finish();

            let (count, idle) = &*outstanding;
            let mut count = count.lock();
            *count -= 1;
            if *count == 0 {
                idle.notify_all();
            }
        });
        true
    }

    /// Tasks submitted and not yet finished
    pub fn outstanding(&self) -> usize {
        *self.outstanding.0.lock()
    }

    /// Block until every submitted task has finished or `timeout` passes.
    /// Returns whether the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, idle) = &*self.outstanding;
        let mut count = count.lock();
        while *count > 0 {
            if idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_in_flight_guard() {
        let guard = InFlight::default();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.finish();
        assert!(guard.try_begin());
    }

    #[test]
    fn test_stagger_spreads_due_times() {
        let start = Instant::now();
        let mut window = StaggerWindow::new(Duration::from_secs(60), start);
        for key in [7u64, 3, 9, 3] {
            window.register(key);
        }
        assert_eq!(window.len(), 3);

        assert!(window.rebalance(start + Duration::from_secs(30), Duration::from_secs(15)).is_none());

        let now = start + Duration::from_secs(60);
        let due = window.rebalance(now, Duration::from_secs(15)).unwrap();
        assert_eq!(
            due,
            vec![
                (7, now),
                (3, now + Duration::from_secs(5)),
                (9, now + Duration::from_secs(10)),
            ]
        );
        assert!(window.is_empty());
    }

    #[test]
    fn test_stagger_empty_window_restarts() {
        let start = Instant::now();
        let mut window: StaggerWindow<u64> = StaggerWindow::new(Duration::from_secs(1), start);
        let later = start + Duration::from_secs(2);
        assert_eq!(window.rebalance(later, Duration::from_secs(10)), Some(Vec::new()));
        assert!(window.rebalance(later + Duration::from_millis(500), Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_submit_runs_job() {
        let scheduler = RefreshScheduler::new(1, Arc::new(Metrics::new())).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = Arc::new(InFlight::default());

        let h = hits.clone();
        assert!(scheduler.submit(guard.clone(), "test", move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!guard.is_running());
    }

    #[test]
    fn test_submit_rejected_while_in_flight() {
        let scheduler = RefreshScheduler::new(1, Arc::new(Metrics::new())).unwrap();
        let guard = Arc::new(InFlight::default());
        assert!(guard.try_begin());
        assert!(!scheduler.submit(guard.clone(), "test", || {}));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let metrics = Arc::new(Metrics::new());
        let scheduler = RefreshScheduler::new(1, metrics.clone()).unwrap();
        let guard = Arc::new(InFlight::default());

        scheduler.submit(guard.clone(), "test", || panic!("boom"));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(metrics.refresh_failures.load(Ordering::Relaxed), 1);
        assert!(!guard.is_running());
    }
}
