//! Exponential backoff.
//!
//! Delays double from `base` up to `max`.

use std::time::Duration;

/// Stateful exponential backoff for one in-memory retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            max: max.max(base),
            current: base,
        }
    }

    /// Return the delay to wait before the next attempt and advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Delay before retry number `attempt` (1-based), for callers that persist
/// the attempt counter instead of holding a [`Backoff`].
pub fn delay_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(max.max(base))
}
