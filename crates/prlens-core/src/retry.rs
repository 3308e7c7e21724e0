//! Exponential backoff with jitter.
//!
//! Shared by the upstream connector and the client reconnection loop.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.0 disables jitter).
    pub jitter_factor: f64,
    /// Consecutive failures allowed before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, handy for deterministic tests.
    #[must_use]
    pub fn fixed(base_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`, then jittered.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_millis(attempt);
        if self.jitter_factor <= 0.0 || capped == 0.0 {
            return Duration::from_millis(capped as u64);
        }
        let range = capped * self.jitter_factor;
        let jitter = rand::rng().random_range(-range..=range);
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis((capped + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    fn capped_millis(&self, attempt: u32) -> f64 {
        let base = self.base_delay.as_millis() as f64;
        let exp = base * 2.0_f64.powi(attempt.min(32) as i32);
        exp.min(self.max_delay.as_millis() as f64)
    }
}
