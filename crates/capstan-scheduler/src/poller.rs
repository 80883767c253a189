//! The polling lifecycle: buffered claim requests and work cycles.
//!
//! A cooperative, single-consumer scheduler that emits work cycles when
//! either the poll timer elapses or an explicit claim request is buffered
//! while the pool has capacity. Each cycle drains the buffered request IDs
//! and hands them to the `work` callback, bounded by the work-phase
//! timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capstan_core::TaskId;

use crate::error::{Error, Result};
use crate::metrics::SchedulerMetrics;

/// The per-cycle work callback: receives the drained explicit request IDs
/// (possibly empty on a plain timer tick).
pub type WorkHandler = Arc<dyn Fn(Vec<TaskId>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Reports the pool capacity gating on-demand cycles.
pub type CapacityFn = Arc<dyn Fn() -> usize + Send + Sync>;

/// Bounded FIFO buffer of explicit claim requests.
///
/// Shared between the facade (producer) and the poller (consumer), and
/// deliberately outside the poller itself so that buffered requests
/// survive a monitor-triggered poller restart.
#[derive(Debug)]
pub struct RequestBuffer {
    queue: Mutex<VecDeque<TaskId>>,
    capacity: usize,
    notify: Notify,
}

impl RequestBuffer {
    /// Creates a buffer holding at most `capacity` requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Buffers an explicit claim request and wakes the poller.
    ///
    /// # Errors
    ///
    /// Returns `RequestCapacityReached` when the buffer is full.
    pub fn request(&self, id: TaskId) -> Result<()> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                return Err(Error::RequestCapacityReached { task_id: id });
            }
            queue.push_back(id);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drains all buffered requests.
    #[must_use]
    pub fn drain(&self) -> Vec<TaskId> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    /// Number of buffered requests.
    #[must_use]
    pub fn depth(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.len()
    }

    /// Waits for a request to be buffered.
    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Tracks when the poller last emitted a cycle.
///
/// Shared with the monitor, which tears down and recreates a poller whose
/// clock goes stale.
#[derive(Debug)]
pub struct PollerActivity {
    last_cycle: Mutex<Instant>,
}

impl Default for PollerActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerActivity {
    /// Creates a tracker starting from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_cycle: Mutex::new(Instant::now()),
        }
    }

    /// Records a cycle emission.
    pub fn record_cycle(&self) {
        let mut last = self.last_cycle.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Instant::now();
    }

    /// Time since the last cycle emission.
    #[must_use]
    pub fn elapsed_since_last_cycle(&self) -> Duration {
        let last = self.last_cycle.lock().unwrap_or_else(PoisonError::into_inner);
        last.elapsed()
    }
}

/// The work-cycle emitter.
///
/// Emits when (a) the timer elapses, or (b) explicit requests are buffered
/// and the pool has capacity. Each `work` invocation is bounded by
/// `poll_interval × work_timeout_cycles`; a timeout is reported as a
/// poller error while tasks already handed to the pool continue to run.
pub struct TaskPoller {
    requests: Arc<RequestBuffer>,
    activity: Arc<PollerActivity>,
    poll_interval: watch::Receiver<Duration>,
    work_timeout_cycles: u32,
    work: WorkHandler,
    capacity: CapacityFn,
    metrics: SchedulerMetrics,
}

impl TaskPoller {
    /// Creates a poller.
    #[must_use]
    pub fn new(
        requests: Arc<RequestBuffer>,
        activity: Arc<PollerActivity>,
        poll_interval: watch::Receiver<Duration>,
        work_timeout_cycles: u32,
        work: WorkHandler,
        capacity: CapacityFn,
    ) -> Self {
        Self {
            requests,
            activity,
            poll_interval,
            work_timeout_cycles,
            work,
            capacity,
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Drives poll cycles until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let interval = *self.poll_interval.borrow();

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
                () = self.requests.notified() => {
                    // On-demand cycles only run when the pool can take
                    // work; buffered requests otherwise wait for the
                    // next timer tick.
                    if (self.capacity)() == 0 {
                        continue;
                    }
                }
            }

            self.cycle(interval, &shutdown).await;
        }
    }

    /// Runs one work cycle.
    async fn cycle(&self, interval: Duration, shutdown: &CancellationToken) {
        let ids = self.requests.drain();
        self.activity.record_cycle();
        self.metrics.set_request_buffer_depth(self.requests.depth());

        if !ids.is_empty() {
            debug!(requests = ids.len(), "poll cycle with explicit claim requests");
        }

        let work_timeout = interval * self.work_timeout_cycles;
        tokio::select! {
            // Shutdown abandons the cycle; in-flight tasks already handed
            // to the pool are the pool's to cancel.
            () = shutdown.cancelled() => {}
            outcome = tokio::time::timeout(work_timeout, (self.work)(ids)) => match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "poll cycle work failed");
                }
                Err(_) => {
                    let err = Error::PollerWorkTimeout {
                        timeout: work_timeout,
                    };
                    self.metrics.record_poller_timeout();
                    warn!(error = %err, "poll cycle work timed out");
                }
            }
        }
    }
}
