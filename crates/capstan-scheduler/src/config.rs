//! Scheduler configuration.
//!
//! All recognized options with their defaults. Durations deserialize from
//! humantime strings (`"3s"`, `"5m"`), matching how operators write them
//! in configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default base poll period.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default concurrency ceiling.
const DEFAULT_MAX_WORKERS: usize = 10;

/// Default per-type retry ceiling.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default work-phase timeout multiplier.
const DEFAULT_MAX_POLL_INACTIVITY_CYCLES: u32 = 10;

/// Default explicit-request buffer size.
const DEFAULT_REQUEST_CAPACITY: usize = 1000;

/// Default claim lease length.
const DEFAULT_CLAIM_WINDOW: Duration = Duration::from_secs(30);

/// Default ceiling for the managed poll interval under backpressure.
const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Master switch; a disabled scheduler accepts writes but never polls.
    pub enabled: bool,

    /// Default per-type retry ceiling, used when a task definition does
    /// not set its own.
    pub max_attempts: u32,

    /// Base poll period.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Concurrency ceiling for the worker pool.
    pub max_workers: usize,

    /// Document-store index name.
    pub index: String,

    /// Work-phase timeout multiplier: a poll cycle's `work` callback is
    /// bounded by `poll_interval × max_poll_inactivity_cycles`, and the
    /// poller itself is restarted after one further cycle of silence.
    pub max_poll_inactivity_cycles: u32,

    /// Capacity of the explicit run-now request buffer.
    pub request_capacity: usize,

    /// Claim lease length: a claimed task's `retry_at` is set to
    /// `now + claim_window`, after which the claim may be reclaimed.
    #[serde(with = "humantime_serde")]
    pub claim_window: Duration,

    /// Ceiling for the poll interval when backpressure lengthens it.
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,

    /// Staleness limit for the health signal; defaults to
    /// `poll_interval + 1s` when unset.
    #[serde(with = "humantime_serde::option")]
    pub monitored_stats_required_freshness: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_workers: DEFAULT_MAX_WORKERS,
            index: "capstan_task_manager".to_string(),
            max_poll_inactivity_cycles: DEFAULT_MAX_POLL_INACTIVITY_CYCLES,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            claim_window: DEFAULT_CLAIM_WINDOW,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            monitored_stats_required_freshness: None,
        }
    }
}

impl SchedulerConfig {
    /// Sets the base poll period.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the worker-pool concurrency ceiling.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the default retry ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the explicit-request buffer capacity.
    #[must_use]
    pub const fn with_request_capacity(mut self, request_capacity: usize) -> Self {
        self.request_capacity = request_capacity;
        self
    }

    /// Sets the claim lease length.
    #[must_use]
    pub const fn with_claim_window(mut self, claim_window: Duration) -> Self {
        self.claim_window = claim_window;
        self
    }

    /// Work-phase timeout: how long one `work` invocation may run.
    #[must_use]
    pub fn work_timeout(&self) -> Duration {
        self.poll_interval * self.max_poll_inactivity_cycles
    }

    /// Poller inactivity threshold: silence beyond this gets the poller
    /// torn down and recreated.
    #[must_use]
    pub fn poller_inactivity_timeout(&self) -> Duration {
        self.poll_interval * (self.max_poll_inactivity_cycles + 1)
    }

    /// Staleness limit for the health signal.
    #[must_use]
    pub fn required_freshness(&self) -> Duration {
        self.monitored_stats_required_freshness
            .unwrap_or(self.poll_interval + Duration::from_secs(1))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when any option is out of its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig {
                message: "maxWorkers must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "pollInterval must be positive".to_string(),
            });
        }
        if self.request_capacity == 0 {
            return Err(Error::InvalidConfig {
                message: "requestCapacity must be at least 1".to_string(),
            });
        }
        if self.max_poll_inactivity_cycles == 0 {
            return Err(Error::InvalidConfig {
                message: "maxPollInactivityCycles must be at least 1".to_string(),
            });
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(Error::InvalidConfig {
                message: "maxPollInterval must not be below pollInterval".to_string(),
            });
        }
        Ok(())
    }
}
