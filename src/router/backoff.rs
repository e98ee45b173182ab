//! Exponential backoff for retryable channel failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// `delay(n) = min(cap, base * factor^(n-1))`, then jittered by
/// ±`jitter_pct` percent.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter_pct: f64,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            factor: config.factor.max(1.0),
            cap: Duration::from_secs(config.cap_secs),
            jitter_pct: config.jitter_pct.clamp(0.0, 100.0),
        }
    }

    /// Unjittered delay before attempt `n + 1`, for `n >= 1` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.cap.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.cap
        }
    }

    /// Jittered delay using `rng`.
    pub fn jittered_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_pct <= 0.0 {
            return delay;
        }
        let spread = self.jitter_pct / 100.0;
        let scale = rng.gen_range(1.0 - spread..=1.0 + spread);
        Duration::from_secs_f64(delay.as_secs_f64() * scale)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn jittered(&self, attempt: u32) -> Duration {
        self.jittered_with(attempt, &mut rand::thread_rng())
    }
}
