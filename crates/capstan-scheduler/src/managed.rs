//! Live configuration derived from observed store health.
//!
//! The managed configuration consumes the store's error stream and
//! publishes two live values: the worker ceiling and the poll interval.
//! Under a sustained overload signal both move to shed load (workers
//! down multiplicatively, interval up by the inverse factor), and both
//! recover toward their configured limits once the signal clears.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetrics;
use crate::store::{StoreErrorKind, StoreEvent};

/// Multiplicative decay applied to the worker ceiling per overloaded
/// window; the poll interval lengthens by the inverse.
const DECAY_FACTOR: f64 = 0.8;

/// Clean observation windows required before one recovery step.
const CLEAN_WINDOWS_FOR_RECOVERY: u32 = 5;

/// Live scheduler limits, adjusted in response to store backpressure.
#[derive(Debug)]
pub struct ManagedConfiguration {
    configured_workers: usize,
    configured_interval: Duration,
    max_interval: Duration,
    window: Duration,
    max_workers: watch::Sender<usize>,
    poll_interval: watch::Sender<Duration>,
    metrics: SchedulerMetrics,
}

impl ManagedConfiguration {
    /// Creates a managed configuration starting at the configured limits.
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        let (max_workers, _) = watch::channel(config.max_workers);
        let (poll_interval, _) = watch::channel(config.poll_interval);
        Self {
            configured_workers: config.max_workers,
            configured_interval: config.poll_interval,
            max_interval: config.max_poll_interval,
            window: config.poll_interval,
            max_workers,
            poll_interval,
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Subscribes to the live worker ceiling.
    #[must_use]
    pub fn max_workers(&self) -> watch::Receiver<usize> {
        self.max_workers.subscribe()
    }

    /// Subscribes to the live poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> watch::Receiver<Duration> {
        self.poll_interval.subscribe()
    }

    /// Drives the controller until shutdown.
    ///
    /// Observation windows are one base poll interval long. An overload
    /// error anywhere in a window makes that window count as overloaded;
    /// at most one adjustment is applied per window.
    pub async fn run(
        &self,
        mut errors: broadcast::Receiver<StoreEvent>,
        shutdown: CancellationToken,
    ) {
        let mut window = tokio::time::interval(self.window);
        window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut overloaded = false;
        let mut clean_windows = 0_u32;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = errors.recv() => match event {
                    Ok(event) => {
                        self.metrics.record_store_error(event.kind.as_label());
                        match event.kind {
                            StoreErrorKind::Overload => {
                                warn!(message = %event.message, "task store reported overload");
                                overloaded = true;
                            }
                            StoreErrorKind::Fatal => {
                                warn!(message = %event.message, "task store reported a fatal configuration error");
                            }
                            StoreErrorKind::Other => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropping error events under load is itself an
                        // overload signal.
                        warn!(skipped, "store error stream lagged");
                        overloaded = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = window.tick() => {
                    if overloaded {
                        clean_windows = 0;
                        self.decay();
                    } else {
                        clean_windows += 1;
                        if clean_windows >= CLEAN_WINDOWS_FOR_RECOVERY {
                            clean_windows = 0;
                            self.recover();
                        }
                    }
                    overloaded = false;
                }
            }
        }
    }

    /// Applies one load-shedding step: workers down, interval up.
    fn decay(&self) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        #[allow(clippy::cast_precision_loss)]
        let workers = ((*self.max_workers.borrow() as f64) * DECAY_FACTOR).floor() as usize;
        let workers = workers.max(1);

        let interval = self
            .poll_interval
            .borrow()
            .mul_f64(1.0 / DECAY_FACTOR)
            .min(self.max_interval);

        info!(
            max_workers = workers,
            poll_interval_ms = interval.as_millis(),
            "shedding load after store overload"
        );
        let _ = self.max_workers.send(workers);
        let _ = self.poll_interval.send(interval);
    }

    /// Applies one recovery step toward the configured limits.
    fn recover(&self) {
        let workers = (*self.max_workers.borrow() + 1).min(self.configured_workers);
        let interval = self
            .poll_interval
            .borrow()
            .mul_f64(DECAY_FACTOR)
            .max(self.configured_interval);

        if workers != *self.max_workers.borrow() || interval != *self.poll_interval.borrow() {
            info!(
                max_workers = workers,
                poll_interval_ms = interval.as_millis(),
                "recovering toward configured limits"
            );
        }
        let _ = self.max_workers.send(workers);
        let _ = self.poll_interval.send(interval);
    }

    #[cfg(test)]
    fn apply_window(&self, overloaded: bool, clean_windows: &mut u32) {
        if overloaded {
            *clean_windows = 0;
            self.decay();
        } else {
            *clean_windows += 1;
            if *clean_windows >= CLEAN_WINDOWS_FOR_RECOVERY {
                *clean_windows = 0;
                self.recover();
            }
        }
    }
}
