//! Retry backoff schedule

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter
///
/// Attempt `k` (zero-based) sleeps `min(base * 2^k, max) * (1 +/- jitter)`.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl RetrySchedule {
    /// Create a schedule; `jitter` is a fraction in [0, 1)
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    /// Backoff for the given zero-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max);
        if self.jitter == 0.0 {
            return exp;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((exp.as_secs_f64() * factor).max(0.0))
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8), 0.25)
    }
}
