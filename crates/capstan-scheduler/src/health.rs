//! Health signal derived from monitoring snapshots.
//!
//! Each claim cycle updates a stats snapshot; the health status is derived
//! from how stale that snapshot is, so a wedged poller surfaces as
//! degraded health even when nothing is logging.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Derived status level for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Stats are fresh.
    Ok,
    /// Stats are older than one poll interval but within the freshness
    /// limit.
    Warn,
    /// Stats are older than the freshness limit (or absent entirely).
    Error,
}

/// Snapshot of the most recent scheduler activity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredStats {
    /// When the last poll cycle ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Tasks claimed in the last cycle.
    pub last_claim_count: usize,
    /// Tasks claimed since start.
    pub total_claimed: u64,
    /// Runners in flight at the last cycle.
    pub running: usize,
}

impl MonitoredStats {
    /// Derives the status level at `now` given the freshness thresholds.
    #[must_use]
    pub fn status_at(
        &self,
        now: DateTime<Utc>,
        poll_interval: Duration,
        required_freshness: Duration,
    ) -> HealthStatus {
        let Some(last_polled_at) = self.last_polled_at else {
            return HealthStatus::Error;
        };

        let age = now.signed_duration_since(last_polled_at);
        let warn_after = chrono::Duration::from_std(poll_interval).unwrap_or(chrono::Duration::MAX);
        let error_after =
            chrono::Duration::from_std(required_freshness).unwrap_or(chrono::Duration::MAX);

        if age > error_after {
            HealthStatus::Error
        } else if age > warn_after {
            HealthStatus::Warn
        } else {
            HealthStatus::Ok
        }
    }
}

/// Shared handle the claim cycle writes through.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<MonitoredStats>>,
}

impl StatsHandle {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed claim cycle.
    pub fn record_cycle(&self, claimed: usize, running: usize) {
        if let Ok(mut stats) = self.inner.write() {
            stats.last_polled_at = Some(Utc::now());
            stats.last_claim_count = claimed;
            stats.total_claimed += claimed as u64;
            stats.running = running;
        }
    }

    /// Returns a snapshot of the current stats.
    #[must_use]
    pub fn snapshot(&self) -> MonitoredStats {
        self.inner
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}
