//! Explicit retry policy for transient upstream failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Bounded exponential backoff with jitter. Passed as configuration to each
/// call site rather than applied as cross-cutting magic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            config.jitter,
        )
    }

    /// No retries at all; a single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0, 0.0)
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }

    pub fn has_more_attempts(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
