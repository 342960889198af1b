//! Module providing exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule: attempt `n` waits a uniformly random duration in
/// `[0, min(cap, base * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the jitter window for the given attempt (0 based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);

        self.base
            .checked_mul(factor)
            .map_or(self.cap, |x| x.min(self.cap))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;

        if ceiling == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}
