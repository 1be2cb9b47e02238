//! Monotonic-clock token bucket for the debouncer's rate ceiling.

use std::time::{Duration, Instant};

/// Refills continuously at `rate_per_second`, holding at most one second's
/// worth of tokens so the average over any one-second window stays at or
/// below the ceiling.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_second: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: u32) -> Self {
        let capacity = f64::from(rate_per_second.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate_per_second: capacity,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.rate_per_second).min(self.capacity);
        self.refilled_at = now;
    }

    /// Takes one token if available.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// How long until one token is available, zero if one already is.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(
                (1.0 - self.tokens) / self.rate_per_second,
            )
        }
    }
}
