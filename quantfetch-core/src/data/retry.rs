//! Bounded retry with exponential backoff.
//!
//! Wraps a single source request. Only transient errors are retried; the last
//! error is surfaced once retries are exhausted. Backoff pauses go through the
//! same [`Pacer`] as request throttling.

use super::provider::{DataError, Pacer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retry configuration for source requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Fraction of the delay added as random extra (0.0 = deterministic).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No retries: the first failure is returned as-is.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), before jitter.
    ///
    /// `max_delay` bounds the exponential term only. A rate-limit response
    /// never waits less than the provider's retry-after.
    pub fn delay_for(&self, attempt: u32, error: &DataError) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        match error {
            DataError::RateLimited { retry_after_secs } => {
                delay.max(Duration::from_secs(*retry_after_secs))
            }
            _ => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        delay + Duration::from_secs_f64(extra)
    }

    /// Run `op`, retrying transient failures.
    pub fn run<T>(
        &self,
        pacer: &dyn Pacer,
        what: &str,
        mut op: impl FnMut() -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.jittered(self.delay_for(attempt, &e));
                    warn!(
                        request = what,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    pacer.pause(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
