//! Resilience primitives
//!
//! Admission control and backoff machinery that shields deployments from
//! overload: token bucket, FIFO semaphore, adaptive concurrency limiter,
//! distributed caller budgets, circuit breaker, and the retry schedule.

pub mod adaptive;
pub mod batch;
pub mod circuit_breaker;
pub mod retry;
pub mod semaphore;
pub mod token_bucket;

pub use adaptive::{GradientConfig, GradientLimiter};
pub use batch::{
    DistributedRateLimiter, InMemoryRateLimitStore, LimitKind, RateLimitDecision,
    RateLimitDescriptor, RateLimitStore,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use retry::RetrySchedule;
pub use semaphore::{AcquireError, FifoSemaphore};
pub use token_bucket::TokenBucket;
