//! Per-request cache control options

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request cache directives
///
/// Recognized options: `ttl`, `namespace`, `no-cache` (skip read),
/// `no-store` (skip write), `s-maxage` (maximum acceptable age of a
/// cached entry).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheControl {
    /// Entry lifetime override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Cache namespace, keeps tenants apart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Skip the cache read
    #[serde(default, rename = "no-cache")]
    pub no_cache: bool,
    /// Skip the cache write
    #[serde(default, rename = "no-store")]
    pub no_store: bool,
    /// Maximum acceptable entry age in seconds
    #[serde(default, rename = "s-maxage", skip_serializing_if = "Option::is_none")]
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    /// Extract cache directives from a request's extra parameters
    ///
    /// Looks for a `cache` object in the unrecognized parameter map;
    /// absent or malformed directives fall back to defaults.
    pub fn from_extra_params(
        extra: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Self {
        extra
            .get("cache")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// TTL override as a [`Duration`]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.map(Duration::from_secs)
    }

    /// Maximum acceptable age as a [`Duration`]
    pub fn max_age(&self) -> Option<Duration> {
        self.s_maxage.map(Duration::from_secs)
    }
}
