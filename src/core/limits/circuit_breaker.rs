//! Circuit breaker
//!
//! Classic closed/open/half-open breaker, offered as a library primitive.
//! The production path relies on time-based cooldown instead; when a
//! breaker is enabled alongside it, availability is the intersection of
//! the two signals.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected
    Open,
    /// A limited number of probe requests are admitted
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Minimum observations before the failure threshold applies
    pub min_requests: u32,
    /// Time the circuit stays open before probing
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            min_requests: 10,
            open_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    opened_at: Option<Instant>,
}

/// Metrics snapshot for observability surfaces
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Consecutive half-open successes
    pub success_count: u32,
    /// Observations since the last close
    pub request_count: u32,
}

/// Circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may proceed right now
    ///
    /// An open circuit transitions to half-open once its timeout passes.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_timeout);
                if expired {
                    debug!("circuit transitioning open -> half-open");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.request_count += 1;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    debug!("circuit transitioning half-open -> closed");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.request_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.failure_count += 1;
        match state.state {
            CircuitState::HalfOpen => {
                debug!("circuit probe failed, half-open -> open");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            CircuitState::Closed => {
                if state.request_count >= self.config.min_requests
                    && state.failure_count >= self.config.failure_threshold
                {
                    debug!("failure threshold reached, closed -> open");
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        CircuitBreakerMetrics {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            request_count: state.request_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            min_requests: 3,
            open_timeout,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        for _ in 0..3 {
            assert!(breaker.allow_request());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_cycle() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..3 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // One probe failure slams it shut again
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow_request());
        breaker.on_success();
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
