// src/client/backoff.rs

//! Exponential backoff with full jitter for reconnect and retry loops.

use rand::Rng;
use std::time::Duration;

/// The initial delay of a fresh backoff sequence.
pub const BASE_DELAY: Duration = Duration::from_millis(100);

/// Produces a sequence of randomized delays: each attempt doubles the
/// ceiling up to the cap, and the actual delay is drawn uniformly from
/// `[0, ceiling]` (full jitter).
#[derive(Debug)]
pub struct Backoff {
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// `cap` is usually twice the operation timeout.
    pub fn new(cap: Duration) -> Self {
        Self { cap, attempt: 0 }
    }

    /// The next delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = BASE_DELAY
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let nanos = ceiling.as_nanos().max(1) as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }

    /// Resets after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
