//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule: `base * 2^(attempt-1)` plus up to 25% jitter, never
/// longer than `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base,
            max_delay,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        jittered(self.base_delay(attempt)).min(self.max_delay)
    }

    /// Wait before retrying attempt `attempt`: the server's `Retry-After`
    /// when it sent one, capped at `max_delay`.
    pub fn wait(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(asked) if asked > self.max_delay => {
                tracing::warn!(
                    asked_ms = asked.as_millis() as u64,
                    max_ms = self.max_delay.as_millis() as u64,
                    "Capping server-requested retry delay"
                );
                self.max_delay
            }
            Some(asked) => asked,
            None => self.delay(attempt),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Add up to 25% random jitter so retrying clients spread out.
pub fn jittered(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

/// Shrink a page size after a failed attempt, never below `floor`.
pub fn downsize(page_size: u32, floor: u32) -> u32 {
    ((f64::from(page_size) * 0.6) as u32).max(floor).min(page_size)
}
