//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Routing strategy selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingStrategyConfig {
    /// Weighted random selection
    #[default]
    SimpleShuffle,
    /// Per-model monotonic counter
    RoundRobin,
    /// Smallest EWMA latency first
    LowestLatency,
    /// Fewest in-flight requests first
    LeastBusy,
    /// Smallest current-minute TPM ratio first
    LowestTpmRpm,
    /// Cheapest projected cost first
    LowestCost,
    /// Strict tag intersection, then a secondary strategy
    TagBased {
        /// Strategy applied after tag filtering
        #[serde(default)]
        secondary: Box<RoutingStrategyConfig>,
    },
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Routing strategy
    #[serde(default)]
    pub strategy: RoutingStrategyConfig,
    /// Whether the selection loop retries on other deployments
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Extra attempts after the first (total attempts = 1 + retry_count)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Base retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    /// Jitter fraction applied to each backoff, in [0, 1)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    /// Per-attempt provider deadline in milliseconds (0 = unbounded)
    #[serde(default)]
    pub attempt_timeout_ms: u64,
    /// Cooldown applied to a deployment on failure signals, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_period_secs: u64,
    /// EWMA smoothing factor for latency tracking
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Provider type placed first among candidates before tie-breaks
    #[serde(default)]
    pub default_provider: Option<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategyConfig::default(),
            fallback_enabled: true,
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            retry_jitter: default_retry_jitter(),
            attempt_timeout_ms: 0,
            cooldown_period_secs: default_cooldown_secs(),
            ewma_alpha: default_ewma_alpha(),
            default_provider: None,
        }
    }
}

impl RouterSettings {
    /// Cooldown period as a [`Duration`]
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_secs)
    }

    /// Base retry backoff as a [`Duration`]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Backoff ceiling as a [`Duration`]
    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    /// Per-attempt deadline, `None` when unbounded
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.attempt_timeout_ms))
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_retry_max_backoff_ms() -> u64 {
    8_000
}

fn default_retry_jitter() -> f64 {
    0.25
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_ewma_alpha() -> f64 {
    0.1
}
