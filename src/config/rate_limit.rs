//! Caller-side rate limiter configuration

use serde::{Deserialize, Serialize};

/// How caller rate-limit keys are derived from a request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One budget per API key
    #[default]
    ApiKey,
    /// One budget per end user
    User,
    /// One budget per requested model
    Model,
    /// One budget per (API key, model) pair
    ApiKeyModel,
}

/// Distributed rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Whether the caller rate limiter runs at all
    #[serde(default)]
    pub enabled: bool,
    /// Requests per window per key (0 disables)
    #[serde(default)]
    pub rpm_limit: u64,
    /// Tokens per window per key (0 disables)
    #[serde(default)]
    pub tpm_limit: u64,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Key derivation strategy
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Admit requests when the backing store is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpm_limit: 0,
            tpm_limit: 0,
            window_secs: default_window_secs(),
            key_strategy: KeyStrategy::default(),
            fail_open: true,
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}
