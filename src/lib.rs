//! # modelmux
//!
//! Routing core for an OpenAI-compatible LLM gateway. The crate owns
//! the parts of a gateway that are hard to get right and leaves the
//! HTTP front-end, config loading, and per-vendor adapters to the
//! embedding host:
//!
//! - a **routing engine** choosing one deployment among many, tracking
//!   per-deployment health, latency, load, and minute budgets;
//! - a **resilience layer**: adaptive concurrency, token buckets, FIFO
//!   semaphores, distributed caller budgets, failure-driven cooldown;
//! - a **plugin pipeline** with priority-ordered pre/post hooks,
//!   short-circuits, and streaming hooks;
//! - a **request orchestrator** gluing them together, with fallback
//!   across deployments and mid-stream recovery;
//! - a **telemetry builder** emitting one scrubbed record per request.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use modelmux::prelude::*;
//!
//! let registry = Arc::new(DeploymentRegistry::new());
//! registry.register(
//!     Deployment::new("openai-gpt4-primary", "gpt-4-turbo", provider_handle)
//!         .with_alias("gpt-4"),
//! );
//!
//! let stats = Arc::new(LocalStatsStore::new(0.1));
//! let orchestrator = OrchestratorBuilder::new(GatewayConfig::default(), registry, stats).build();
//!
//! let ctx = RequestContext::new(client_request_id);
//! let reply = orchestrator.chat(&ctx, request).await?;
//! ```

pub mod config;
pub mod core;
pub mod utils;

pub use crate::utils::error::{ErrorKind, GatewayError, Result};

/// Common imports for embedding hosts
pub mod prelude {
    pub use crate::config::{
        GatewayConfig, KeyStrategy, PipelineSettings, RateLimiterConfig, RouterSettings,
        RoutingStrategyConfig, SsrfPolicy, StreamRecoveryMode, StreamRecoverySettings,
    };
    pub use crate::core::limits::{
        DistributedRateLimiter, FifoSemaphore, GradientLimiter, InMemoryRateLimitStore,
        RateLimitStore, TokenBucket,
    };
    pub use crate::core::orchestrator::{GatewayReply, OrchestratorBuilder, RequestOrchestrator};
    pub use crate::core::pipeline::{
        CachePlugin, Plugin, PluginContext, PluginPipeline, PreHookResult, RequestOutcome,
        ShortCircuit,
    };
    pub use crate::core::providers::{
        AdapterCapabilities, CompletionService, HttpTransport, ProviderAdapter, ProviderClient,
        ProviderHandle, ProviderResult, UnifiedRequest, UnifiedResponse,
    };
    pub use crate::core::router::{
        Deployment, DeploymentConfig, DeploymentRegistry, DistributedStatsStore,
        InMemoryStatsBackend, LocalStatsStore, StatsStore,
    };
    pub use crate::core::telemetry::{
        CallbackManager, LoggingCallback, StandardLoggingPayload, TelemetryCallback,
    };
    pub use crate::core::types::{
        ChatChunk, ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
        MessageRole, RequestContext, Usage,
    };
    pub use crate::utils::error::{ErrorKind, GatewayError, Result};
    pub use std::sync::Arc;
}
