//! Cooldown between a failed attempt and the next one.

use std::time::Duration;

/// Default pause before a failed job is retried.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Every retry waits the base cooldown.
    Fixed,
    /// Retry `n` waits `cooldown * factor^(n-1)`, capped at `max`.
    Exponential { factor: f64, max: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub cooldown: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(cooldown: Duration) -> Self {
        Self {
            cooldown,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(cooldown: Duration, factor: f64, max: Duration) -> Self {
        Self {
            cooldown,
            backoff: Backoff::Exponential { factor, max },
        }
    }

    /// Delay before re-enqueueing a job whose `retry_count` just became
    /// `retry` (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.cooldown,
            Backoff::Exponential { factor, max } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.cooldown.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_COOLDOWN)
    }
}
