//! Observability metrics for the scheduler.
//!
//! Prometheus-compatible metrics exposed via the `metrics` crate facade.
//! Designed to support:
//!
//! - **Alerting**: failure rates and poller stalls
//! - **Dashboards**: claim throughput and pool utilization
//! - **Debugging**: correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `capstan_sched_claim_cycles_total` | Counter | `result` | Poll cycle outcomes |
//! | `capstan_sched_claimed_tasks_total` | Counter | - | Tasks claimed across all cycles |
//! | `capstan_sched_task_runs_total` | Counter | `task_type`, `result` | Task run outcomes |
//! | `capstan_sched_task_run_duration_seconds` | Histogram | `task_type`, `result` | Task execution duration |
//! | `capstan_sched_poller_timeouts_total` | Counter | - | Work phases that exceeded their budget |
//! | `capstan_sched_poller_restarts_total` | Counter | - | Pollers torn down by the monitor |
//! | `capstan_sched_available_workers` | Gauge | - | Current pool slack |
//! | `capstan_sched_store_errors_total` | Counter | `kind` | Store errors by classification |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade; the host installs
//! whatever recorder its deployment uses (Prometheus, statsd, ...).

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Poll cycle outcomes.
    pub const CLAIM_CYCLES_TOTAL: &str = "capstan_sched_claim_cycles_total";
    /// Counter: Tasks claimed across all cycles.
    pub const CLAIMED_TASKS_TOTAL: &str = "capstan_sched_claimed_tasks_total";
    /// Counter: Task run outcomes.
    pub const TASK_RUNS_TOTAL: &str = "capstan_sched_task_runs_total";
    /// Histogram: Task execution duration in seconds.
    pub const TASK_RUN_DURATION_SECONDS: &str = "capstan_sched_task_run_duration_seconds";
    /// Histogram: Claim cycle duration in seconds.
    pub const CLAIM_CYCLE_DURATION_SECONDS: &str = "capstan_sched_claim_cycle_duration_seconds";
    /// Counter: Work phases that exceeded their budget.
    pub const POLLER_TIMEOUTS_TOTAL: &str = "capstan_sched_poller_timeouts_total";
    /// Counter: Pollers torn down and recreated by the monitor.
    pub const POLLER_RESTARTS_TOTAL: &str = "capstan_sched_poller_restarts_total";
    /// Gauge: Current worker-pool slack.
    pub const AVAILABLE_WORKERS: &str = "capstan_sched_available_workers";
    /// Gauge: Buffered explicit run-now requests.
    pub const REQUEST_BUFFER_DEPTH: &str = "capstan_sched_request_buffer_depth";
    /// Counter: Store errors by classification.
    pub const STORE_ERRORS_TOTAL: &str = "capstan_sched_store_errors_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of an operation (claimed, empty, failed, ...).
    pub const RESULT: &str = "result";
    /// Task type name.
    pub const TASK_TYPE: &str = "task_type";
    /// Store error classification (overload, fatal, other).
    pub const KIND: &str = "kind";
}

/// High-level interface for recording scheduler metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of one claim cycle.
    pub fn record_claim_cycle(&self, result: &str, claimed: usize) {
        counter!(
            names::CLAIM_CYCLES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
        counter!(names::CLAIMED_TASKS_TOTAL).increment(claimed as u64);
    }

    /// Records a task run outcome and its duration.
    pub fn record_task_run(&self, task_type: &str, result: &str, duration: Duration) {
        counter!(
            names::TASK_RUNS_TOTAL,
            labels::TASK_TYPE => task_type.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
        histogram!(
            names::TASK_RUN_DURATION_SECONDS,
            labels::TASK_TYPE => task_type.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a work phase that exceeded its budget.
    pub fn record_poller_timeout(&self) {
        counter!(names::POLLER_TIMEOUTS_TOTAL).increment(1);
    }

    /// Records a poller teardown by the monitor.
    pub fn record_poller_restart(&self) {
        counter!(names::POLLER_RESTARTS_TOTAL).increment(1);
    }

    /// Updates the pool-slack gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_available_workers(&self, available: usize) {
        gauge!(names::AVAILABLE_WORKERS).set(available as f64);
    }

    /// Updates the request-buffer depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_request_buffer_depth(&self, depth: usize) {
        gauge!(names::REQUEST_BUFFER_DEPTH).set(depth as f64);
    }

    /// Records a store error by classification.
    pub fn record_store_error(&self, kind: &str) {
        counter!(
            names::STORE_ERRORS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use capstan_scheduler::metrics::TimingGuard;
/// use metrics::histogram;
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         histogram!("capstan_sched_claim_cycle_duration_seconds")
///             .record(duration.as_secs_f64());
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for claim-cycle metrics.
#[must_use]
pub fn time_claim_cycle() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::CLAIM_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
