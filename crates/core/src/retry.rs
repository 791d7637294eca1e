// SPDX-License-Identifier: MIT

//! Retry policy shared by steps and the `GraphStore` transaction wrapper.

use std::time::Duration;

/// How many times to retry a retryable failure, and how long to wait
/// between attempts.
///
/// Backoff is `base_delay * factor^(attempt - 1)`, plus up to 25% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            factor,
        }
    }

    /// Delay before the `attempt`-th retry (1-indexed: the first retry is
    /// attempt 1, i.e. after the initial attempt already failed once).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * exp)
    }

    /// Apply deterministic jitter in `[0, max_jitter_frac]` of the base
    /// delay, using `seed` so callers get reproducible behavior under test
    /// while still spreading retries across workers in production (callers
    /// typically seed with a hash of `(job_id, step_name, attempt)`).
    pub fn jittered_backoff(&self, attempt: u32, seed: u64) -> Duration {
        let base = self.backoff(attempt);
        let jitter_frac = (seed % 1000) as f64 / 1000.0 * 0.25;
        base.mul_f64(1.0 + jitter_frac)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), 1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 1.5);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_millis(1500));
        assert_eq!(policy.backoff(3), Duration::from_millis(2250));
    }

    #[test]
    fn jitter_never_shrinks_delay() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 1.5);
        for seed in [0, 1, 500, 999] {
            assert!(policy.jittered_backoff(1, seed) >= policy.backoff(1));
        }
    }

    #[test]
    fn exhausted_at_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
