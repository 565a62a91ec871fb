//! Plugin pipeline and cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Plugin pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Per-PreHook timeout in milliseconds
    #[serde(default = "default_hook_timeout_ms")]
    pub pre_hook_timeout_ms: u64,
    /// Per-PostHook timeout in milliseconds
    #[serde(default = "default_hook_timeout_ms")]
    pub post_hook_timeout_ms: u64,
    /// Registration limit
    #[serde(default = "default_max_plugins")]
    pub max_plugins: usize,
    /// Whether plugin-internal errors are surfaced (informational only)
    #[serde(default)]
    pub propagate_errors: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pre_hook_timeout_ms: default_hook_timeout_ms(),
            post_hook_timeout_ms: default_hook_timeout_ms(),
            max_plugins: default_max_plugins(),
            propagate_errors: false,
        }
    }
}

impl PipelineSettings {
    /// PreHook timeout as a [`Duration`]
    pub fn pre_hook_timeout(&self) -> Duration {
        Duration::from_millis(self.pre_hook_timeout_ms)
    }

    /// PostHook timeout as a [`Duration`]
    pub fn post_hook_timeout(&self) -> Duration {
        Duration::from_millis(self.post_hook_timeout_ms)
    }
}

/// Response cache configuration for the cache plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Default entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Maximum cached responses
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheSettings {
    /// Default TTL as a [`Duration`]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_hook_timeout_ms() -> u64 {
    10_000
}

fn default_max_plugins() -> usize {
    100
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> u64 {
    10_000
}
