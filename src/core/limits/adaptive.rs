//! Adaptive concurrency limiter (gradient algorithm)
//!
//! Tracks the ratio between the best-observed RTT and the recent average.
//! When a backend slows, the average rises faster than the minimum, the
//! gradient drops below 1, and the limit contracts; on recovery the
//! `sqrt(limit)` explore term grows it back.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Gradient limiter configuration
#[derive(Debug, Clone)]
pub struct GradientConfig {
    /// Lower clamp for the limit
    pub min_limit: f64,
    /// Upper clamp for the limit
    pub max_limit: f64,
    /// Starting limit
    pub initial_limit: f64,
    /// Smoothing factor for limit updates
    pub alpha: f64,
    /// RTT window size; an update fires when the window fills
    pub window_size: usize,
    /// Interval after which `min_rtt` is re-seeded to tolerate drift
    pub reset_interval: Duration,
}

impl Default for GradientConfig {
    fn default() -> Self {
        Self {
            min_limit: 1.0,
            max_limit: 200.0,
            initial_limit: 20.0,
            alpha: 0.1,
            window_size: 10,
            reset_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct GradientState {
    limit: f64,
    inflight: u32,
    min_rtt: Option<Duration>,
    min_rtt_seeded_at: Instant,
    window: Vec<Duration>,
}

/// Adaptive concurrency limiter
#[derive(Debug)]
pub struct GradientLimiter {
    config: GradientConfig,
    state: Mutex<GradientState>,
}

impl GradientLimiter {
    /// Create a limiter from its configuration
    pub fn new(config: GradientConfig) -> Self {
        let state = GradientState {
            limit: config.initial_limit.clamp(config.min_limit, config.max_limit),
            inflight: 0,
            min_rtt: None,
            min_rtt_seeded_at: Instant::now(),
            window: Vec::with_capacity(config.window_size),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Admit a request iff in-flight count is below the current limit
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if (state.inflight as f64) < state.limit.ceil() {
            state.inflight += 1;
            true
        } else {
            false
        }
    }

    /// Record completion of an admitted request with its RTT
    pub fn release(&self, rtt: Duration) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);

        let now = Instant::now();
        if now.duration_since(state.min_rtt_seeded_at) >= self.config.reset_interval {
            // Re-seed to the latest sample so old minima do not pin the
            // gradient forever
            state.min_rtt = Some(rtt);
            state.min_rtt_seeded_at = now;
        } else {
            state.min_rtt = Some(match state.min_rtt {
                Some(current) => current.min(rtt),
                None => rtt,
            });
        }

        state.window.push(rtt);
        if state.window.len() < self.config.window_size {
            return;
        }

        let avg_secs =
            state.window.iter().map(Duration::as_secs_f64).sum::<f64>() / state.window.len() as f64;
        state.window.clear();
        let min_secs = state
            .min_rtt
            .map(|d| d.as_secs_f64())
            .unwrap_or(avg_secs);
        if avg_secs <= 0.0 {
            return;
        }

        let gradient = (min_secs / avg_secs).min(1.0);
        let new_limit = state.limit * gradient + state.limit.sqrt();
        state.limit = ((1.0 - self.config.alpha) * state.limit + self.config.alpha * new_limit)
            .clamp(self.config.min_limit, self.config.max_limit);
    }

    /// Release without an RTT sample (failed request)
    pub fn release_failed(&self) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
    }

    /// Current limit
    pub fn limit(&self) -> f64 {
        self.state.lock().limit
    }

    /// Current in-flight count
    pub fn inflight(&self) -> u32 {
        self.state.lock().inflight
    }
}

impl Default for GradientLimiter {
    fn default() -> Self {
        Self::new(GradientConfig::default())
    }
}
