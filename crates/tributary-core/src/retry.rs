use std::time::Duration;

use chrono::{DateTime, Utc};

/// Bounded retry-with-backoff policy for records that fail to apply.
///
/// A record that has failed more than `max_retries` times (the first attempt
/// plus `max_retries` retries) is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay after the first failure; doubles with every further failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Retry on the next cycle with no backoff.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether a record with this many failed attempts should be parked.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }

    /// Backoff after the given number of failures (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Earliest instant a record with this many failures may be retried.
    pub fn retry_after(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(failures))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }
}
