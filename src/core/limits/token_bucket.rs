//! Token bucket with lazy refill

use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: capacity `burst`, refilled at `rate` tokens/second
///
/// Refill is lazy, computed from the wall-clock elapsed since the last
/// call and capped at the burst capacity. A zero rate permits only the
/// initial burst.
#[derive(Debug)]
pub struct TokenBucket {
    burst: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(burst: u64, rate_per_sec: f64) -> Self {
        Self {
            burst: burst as f64,
            rate: rate_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens if available
    pub fn allow(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (refilled to now)
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        state.tokens as u64
    }
}
