//! Poller supervision.
//!
//! The monitor watches the poller's cycle clock and tears down and
//! recreates the poller when it goes silent beyond the inactivity
//! threshold. This guards against a stuck internal state more severe than
//! a single hung `work` phase, which the poller's own timeout already
//! covers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::SchedulerMetrics;
use crate::poller::{PollerActivity, TaskPoller};

/// Builds a fresh poller after a teardown.
///
/// The factory closes over the shared request buffer and activity clock,
/// so buffered run-now requests survive a restart.
pub type PollerFactory = Arc<dyn Fn() -> TaskPoller + Send + Sync>;

/// Watches poller liveness and restarts it past the inactivity threshold.
pub struct ObservableMonitor {
    factory: PollerFactory,
    activity: Arc<PollerActivity>,
    poll_interval: watch::Receiver<Duration>,
    inactivity_cycles: u32,
    metrics: SchedulerMetrics,
}

impl ObservableMonitor {
    /// Creates a monitor over the given poller factory.
    #[must_use]
    pub fn new(
        factory: PollerFactory,
        activity: Arc<PollerActivity>,
        poll_interval: watch::Receiver<Duration>,
        inactivity_cycles: u32,
    ) -> Self {
        Self {
            factory,
            activity,
            poll_interval,
            inactivity_cycles,
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Inactivity threshold: one cycle beyond the work-phase budget.
    fn inactivity_timeout(&self, interval: Duration) -> Duration {
        interval * (self.inactivity_cycles + 1)
    }

    /// Supervises the poller until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut poller_shutdown = shutdown.child_token();
        let mut poller = tokio::spawn((self.factory)().run(poller_shutdown.clone()));

        loop {
            let interval = *self.poll_interval.borrow();

            tokio::select! {
                () = shutdown.cancelled() => {
                    poller_shutdown.cancel();
                    let _ = poller.await;
                    break;
                }
                () = tokio::time::sleep(interval) => {
                    let silence = self.activity.elapsed_since_last_cycle();
                    let threshold = self.inactivity_timeout(interval);
                    if silence <= threshold {
                        continue;
                    }

                    warn!(
                        silence_ms = silence.as_millis(),
                        threshold_ms = threshold.as_millis(),
                        "poller inactive beyond threshold, recreating it"
                    );
                    self.metrics.record_poller_restart();

                    poller_shutdown.cancel();
                    poller.abort();
                    let _ = poller.await;

                    // Reset the clock so the fresh poller gets a full
                    // threshold before the next teardown.
                    self.activity.record_cycle();
                    poller_shutdown = shutdown.child_token();
                    poller = tokio::spawn((self.factory)().run(poller_shutdown.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{CapacityFn, RequestBuffer, WorkHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_work() -> WorkHandler {
        Arc::new(|_ids| Box::pin(async { Ok(()) }))
    }

    fn capacity(n: usize) -> CapacityFn {
        Arc::new(move || n)
    }

    #[tokio::test]
    async fn healthy_poller_is_left_alone() {
        let requests = Arc::new(RequestBuffer::new(10));
        let activity = Arc::new(PollerActivity::new());
        let (_interval_tx, interval_rx) = watch::channel(Duration::from_millis(20));

        let built = Arc::new(AtomicUsize::new(0));
        let factory: PollerFactory = {
            let requests = requests.clone();
            let activity = activity.clone();
            let interval_rx = interval_rx.clone();
            let built = built.clone();
            Arc::new(move || {
                built.fetch_add(1, Ordering::SeqCst);
                TaskPoller::new(
                    requests.clone(),
                    activity.clone(),
                    interval_rx.clone(),
                    1,
                    noop_work(),
                    capacity(10),
                )
            })
        };

        let monitor = ObservableMonitor::new(factory, activity, interval_rx, 1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // A poller that keeps cycling is never recreated
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_poller_is_recreated() {
        let requests = Arc::new(RequestBuffer::new(10));
        let activity = Arc::new(PollerActivity::new());
        // The monitor checks on a fast clock...
        let (_monitor_tx, monitor_rx) = watch::channel(Duration::from_millis(20));
        // ...while the poller itself would only cycle every 30 seconds,
        // so its activity clock goes stale immediately.
        let (_poller_tx, poller_rx) = watch::channel(Duration::from_secs(30));

        let built = Arc::new(AtomicUsize::new(0));
        let factory: PollerFactory = {
            let requests = requests.clone();
            let activity = activity.clone();
            let built = built.clone();
            Arc::new(move || {
                built.fetch_add(1, Ordering::SeqCst);
                TaskPoller::new(
                    requests.clone(),
                    activity.clone(),
                    poller_rx.clone(),
                    1,
                    noop_work(),
                    capacity(10),
                )
            })
        };

        let monitor = ObservableMonitor::new(factory, activity, monitor_rx, 1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Initial build plus at least one restart
        assert!(built.load(Ordering::SeqCst) >= 2);
    }
}
