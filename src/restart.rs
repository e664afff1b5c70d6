//! Restart policies and backoff for supervised services

use std::time::Duration;

/// How a service is retried after failed health checks.
///
/// Delay before restart attempt `n` (zero based) is
/// `min(backoff_base * 2^n, backoff_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before the service is declared failed
    pub max_retries: u32,
    /// Delay before the first restart
    pub backoff_base: Duration,
    /// Ceiling for the exponential delay
    pub backoff_max: Duration,
}

impl RestartPolicy {
    /// Creates a policy with the given limits.
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_max,
        }
    }

    /// Delay before the restart attempt with the given retry count.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.backoff_max)
    }

    /// Returns true once `consecutive_failures` exceeds `max_retries`.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures > self.max_retries
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}
