//! Gateway core configuration
//!
//! All options are plain serde structs; file loading and merging belong
//! to the embedding host.

pub mod pipeline;
pub mod rate_limit;
pub mod router;
pub mod ssrf;
pub mod streaming;

pub use pipeline::{CacheSettings, PipelineSettings};
pub use rate_limit::{KeyStrategy, RateLimiterConfig};
pub use router::{RouterSettings, RoutingStrategyConfig};
pub use ssrf::{SsrfPolicy, validate_base_url};
pub use streaming::{StreamRecoveryMode, StreamRecoverySettings};

use serde::{Deserialize, Serialize};

/// Top-level configuration for the gateway core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Routing and retry behavior
    #[serde(default)]
    pub router: RouterSettings,
    /// Caller-side distributed rate limiter
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    /// Plugin pipeline behavior
    #[serde(default)]
    pub plugin_pipeline: PipelineSettings,
    /// Response cache behavior
    #[serde(default)]
    pub cache: CacheSettings,
    /// Mid-stream recovery behavior
    #[serde(default)]
    pub stream_recovery: StreamRecoverySettings,
}
