//! Token bucket rate limiting, shared by every task of a run.
//!
//! Tokens are reserved up front and the bucket may go into debt; a caller
//! sleeps off its share of the debt outside the lock. A read larger than the
//! burst therefore still completes, just later.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Seconds of tokens a bucket can bank while idle.
const BURST_SECS: f64 = 2.0;

pub struct TokenBucket {
    per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `per_sec` tokens per second (bytes for bandwidth, objects for
    /// throughput), starting with a full two-second burst.
    pub fn new(per_sec: u64) -> Self {
        let per_sec = per_sec.max(1) as f64;
        Self {
            per_sec,
            state: Mutex::new(BucketState {
                available: per_sec * BURST_SECS,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `tokens` and return how long the caller must wait before using
    /// them.
    pub fn reserve(&self, tokens: u64) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * self.per_sec).min(self.per_sec * BURST_SECS);
        state.last_refill = now;

        state.available -= tokens as f64;
        if state.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.available / self.per_sec)
        }
    }

    /// Block until `tokens` may be used.
    pub fn consume(&self, tokens: u64) {
        let wait = self.reserve(tokens);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_free_then_debt_waits() {
        let bucket = TokenBucket::new(1000);
        assert_eq!(bucket.reserve(2000), Duration::ZERO);

        let wait = bucket.reserve(500);
        assert!(wait > Duration::from_millis(400), "{wait:?}");
        assert!(wait <= Duration::from_millis(500), "{wait:?}");

        // debt accumulates for the next caller
        let next = bucket.reserve(500);
        assert!(next > wait, "{next:?} vs {wait:?}");
    }

    #[test]
    fn test_consume_sleeps_off_debt() {
        let bucket = TokenBucket::new(10_000);
        bucket.consume(20_000);
        let started = Instant::now();
        bucket.consume(5_000);
        assert!(started.elapsed() >= Duration::from_millis(450));
    }

    #[test]
    fn test_oversized_request_completes() {
        let bucket = TokenBucket::new(100_000);
        let started = Instant::now();
        bucket.consume(250_000);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.reserve(2), Duration::ZERO);
        assert!(bucket.reserve(1) > Duration::from_millis(900));
    }
}
