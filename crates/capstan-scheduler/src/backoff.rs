//! Retry backoff policy for failed task attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Default base delay before the first retry.
const DEFAULT_BASE: Duration = Duration::from_secs(5 * 60);

/// Default ceiling on the computed (pre-jitter) delay.
const DEFAULT_MAX: Duration = Duration::from_secs(60 * 60);

/// Default bound on jitter, as a fraction of the computed delay.
const DEFAULT_JITTER_FRACTION: f64 = 0.3;

/// Exponential backoff with bounded random jitter.
///
/// The delay for attempt `n` (1-indexed) is
/// `min(max, base × 2^(n−1)) + U(0, jitter_fraction × computed)`.
/// Jitter spreads retries from a fleet that failed simultaneously.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling on the computed delay (jitter is added on top).
    pub max: Duration,
    /// Upper bound on jitter as a fraction of the computed delay.
    pub jitter_fraction: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max: DEFAULT_MAX,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl RetryBackoff {
    /// Creates a backoff policy with the given base and ceiling.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }

    /// Computes the delay before retrying attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        let computed = self.base.saturating_mul(1_u32 << doublings).min(self.max);

        let jitter_bound = computed.as_secs_f64() * self.jitter_fraction;
        let jitter = if jitter_bound > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_bound)
        } else {
            0.0
        };

        computed + Duration::from_secs_f64(jitter)
    }

    /// Computes the next eligibility time after a failed attempt.
    #[must_use]
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX)
    }
}
