//! Retry policy: backoff delays for a scanner loop after infrastructure errors.

use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// Used only between ticks that failed on I/O. Lost races and idle ticks
/// never back off.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first consecutive failure.
    pub base_delay: Duration,

    /// Growth factor per further consecutive failure.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `failures` consecutive failures (1-indexed).
    ///
    /// delay = min(base_delay * multiplier^(failures - 1), max_delay)
    ///
    /// With base_delay=200ms, multiplier=2.0, max_delay=10s:
    /// - failure 1: 200ms
    /// - failure 2: 400ms
    /// - failure 7: 10s (capped)
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
