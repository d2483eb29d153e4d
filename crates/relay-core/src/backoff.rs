//! Retry delay policy.

use std::time::Duration;

/// Capped exponential backoff with uniform jitter.
///
/// The default yields `min(60s, 250ms * 2^min(attempt, 10))` plus up to
/// 250ms of jitter, so colliding retries spread out instead of stampeding.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// The exponent stops growing past this, keeping the shift safe for
    /// arbitrarily large attempt counts.
    pub max_exponent: u32,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(60),
            max_exponent: 10,
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt; `attempt` counts failures so far.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent).min(63);
        let scaled = self.base.saturating_mul(1u32 << exponent.min(31));
        let capped = scaled.min(self.cap);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        capped + jitter
    }
}
