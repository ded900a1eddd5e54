//! Capped exponential backoff shared by the signaling link, peer reconnects
//! and chunk retries.
//!
//! The delay for attempt `k` (1-based) is
//! `min(max, initial * BACKOFF_FACTOR^(k-1))`.

use std::time::Duration;

use crate::core::config::BACKOFF_FACTOR;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    max_attempts: u32,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            factor: BACKOFF_FACTOR,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based). Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        if exp == 0 {
            return self.initial.min(self.max);
        }
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    #[cfg(test)]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `attempt` (1-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
