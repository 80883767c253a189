//! Bounded worker pool for claimed tasks.
//!
//! The pool is *not* a queue: it accepts at most `available_workers`
//! runners per batch and drops the excess on the floor. Dropped runners
//! stay `claiming` in the store and are reclaimed once their lease
//! expires, so the store remains the single source of pending work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use capstan_core::TaskId;

use crate::metrics::SchedulerMetrics;
use crate::runner::TaskRunner;

/// Outcome of handing a batch of runners to the pool.
#[derive(Debug)]
pub struct PoolRunOutcome {
    /// Runners accepted and spawned.
    pub accepted: usize,
    /// Task IDs of runners dropped for lack of capacity; their documents
    /// remain `claiming` and will be reclaimed on lease expiry.
    pub rejected: Vec<TaskId>,
}

#[derive(Debug)]
struct RunningTask {
    task_id: TaskId,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PoolInner {
    running: Mutex<HashMap<u64, RunningTask>>,
    next_slot: AtomicU64,
}

impl PoolInner {
    fn register(&self, task_id: TaskId, cancel: CancellationToken) -> u64 {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(slot, RunningTask { task_id, cancel });
        slot
    }

    fn deregister(&self, slot: u64) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.remove(&slot);
    }

    fn count(&self) -> usize {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.len()
    }

    fn cancel_all(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        for task in running.values() {
            debug!(task_id = %task.task_id, "cancelling in-flight task");
            task.cancel.cancel();
        }
    }
}

/// Bounded concurrent executor for task runners.
///
/// Parameterized by the live worker ceiling so that backpressure-driven
/// decay takes effect on the very next batch.
#[derive(Clone)]
pub struct TaskPool {
    max_workers: watch::Receiver<usize>,
    inner: Arc<PoolInner>,
    metrics: SchedulerMetrics,
}

impl TaskPool {
    /// Creates a pool bounded by the live worker ceiling.
    #[must_use]
    pub fn new(max_workers: watch::Receiver<usize>) -> Self {
        Self {
            max_workers,
            inner: Arc::new(PoolInner::default()),
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Current slack: the worker ceiling minus everything in flight
    /// (including runners still in their mark-running phase).
    #[must_use]
    pub fn available_workers(&self) -> usize {
        let max = *self.max_workers.borrow();
        max.saturating_sub(self.inner.count())
    }

    /// Number of in-flight runners.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.count()
    }

    /// Accepts up to `available_workers` runners and spawns each one.
    ///
    /// Excess runners are returned as rejected and dropped by the caller;
    /// their claims lapse in the store.
    pub fn run(&self, runners: Vec<TaskRunner>) -> PoolRunOutcome {
        let capacity = self.available_workers();
        let mut accepted = 0_usize;
        let mut rejected = Vec::new();

        for runner in runners {
            if accepted >= capacity {
                rejected.push(runner.task_id().clone());
                continue;
            }
            accepted += 1;

            let cancel = CancellationToken::new();
            let slot = self
                .inner
                .register(runner.task_id().clone(), cancel.clone());
            let inner = Arc::clone(&self.inner);

            tokio::spawn(async move {
                runner.process(cancel).await;
                inner.deregister(slot);
            });
        }

        self.metrics.set_available_workers(self.available_workers());

        if !rejected.is_empty() {
            debug!(
                rejected = rejected.len(),
                "pool at capacity, leaving claims to lapse"
            );
        }

        PoolRunOutcome { accepted, rejected }
    }

    /// Signals cancellation to every in-flight runner.
    pub fn cancel_running(&self) {
        self.inner.cancel_all();
    }

    /// Waits until the pool drains or the grace period elapses.
    ///
    /// Returns true if the pool is idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let poll = Duration::from_millis(10);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.inner.count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}
