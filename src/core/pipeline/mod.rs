//! Plugin pipeline
//!
//! Priority-ordered pre/post hooks around each request, with
//! short-circuits (cache hits, rate-limit rejects, mocks), streaming
//! hooks, per-hook timeout isolation, and pooled contexts. PreHooks run
//! in ascending priority; PostHooks mirror exactly the hooks that ran,
//! in reverse (LIFO over `run_from`).

pub mod cache;
pub mod context;

pub use cache::CachePlugin;
pub use context::{ContextPool, PluginContext};

use crate::config::pipeline::PipelineSettings;
use crate::core::providers::{ChunkStream, UnifiedRequest, UnifiedResponse};
use crate::core::types::ChatChunk;
use crate::utils::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// A PreHook result that bypasses the provider call
pub struct ShortCircuit {
    /// Ready response (cache hit, mock)
    pub response: Option<UnifiedResponse>,
    /// Contract error (rate-limit reject); fatal to the request
    pub error: Option<GatewayError>,
    /// Ready chunk source for streaming short-circuits
    pub stream: Option<ChunkStream>,
}

impl ShortCircuit {
    /// Short-circuit with a buffered response
    pub fn with_response(response: UnifiedResponse) -> Self {
        Self {
            response: Some(response),
            error: None,
            stream: None,
        }
    }

    /// Short-circuit with an error
    pub fn with_error(error: GatewayError) -> Self {
        Self {
            response: None,
            error: Some(error),
            stream: None,
        }
    }

    /// Short-circuit with a chunk source
    pub fn with_stream(stream: ChunkStream) -> Self {
        Self {
            response: None,
            error: None,
            stream: Some(stream),
        }
    }
}

impl fmt::Debug for ShortCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortCircuit")
            .field("response", &self.response.is_some())
            .field("error", &self.error)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// PreHook output: the (possibly rewritten) request plus an optional
/// short-circuit
pub struct PreHookResult {
    /// Request to thread to the next hook
    pub request: UnifiedRequest,
    /// Set to skip the remaining PreHooks and the provider call
    pub short_circuit: Option<ShortCircuit>,
}

impl PreHookResult {
    /// Pass the request through unchanged
    pub fn pass(request: UnifiedRequest) -> Self {
        Self {
            request,
            short_circuit: None,
        }
    }
}

/// The `(response, error)` pair threaded through PostHooks
///
/// A PostHook may clear the error (recovery), replace the response, or
/// turn a success into an error.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Response, when the request produced one
    pub response: Option<UnifiedResponse>,
    /// Error, when it failed
    pub error: Option<GatewayError>,
}

impl RequestOutcome {
    /// Successful outcome
    pub fn ok(response: UnifiedResponse) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    /// Failed outcome
    pub fn err(error: GatewayError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }
}

/// A pipeline plugin
///
/// `priority` orders execution: lower runs earlier in Pre and later in
/// Post. Hook default implementations pass everything through, so a
/// plugin implements only the hooks it cares about. A returned `Err` is
/// the plugin's own internal failure; it is logged and never fatal to
/// the request.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name
    fn name(&self) -> &str;

    /// Execution order; lower runs earlier in Pre
    fn priority(&self) -> i32;

    /// Inspect or rewrite the request; may short-circuit
    async fn pre_hook(&self, _ctx: &PluginContext, request: UnifiedRequest) -> Result<PreHookResult> {
        Ok(PreHookResult::pass(request))
    }

    /// Transform the outcome after the provider call
    async fn post_hook(
        &self,
        _ctx: &PluginContext,
        outcome: RequestOutcome,
    ) -> Result<RequestOutcome> {
        Ok(outcome)
    }

    /// Release plugin resources at pipeline shutdown
    async fn cleanup(&self) {}

    /// Whether the streaming hooks below should run for this plugin
    fn handles_streams(&self) -> bool {
        false
    }

    /// Streaming counterpart of `pre_hook`; may short-circuit with a
    /// chunk source
    async fn pre_stream_hook(
        &self,
        _ctx: &PluginContext,
        request: UnifiedRequest,
    ) -> Result<PreHookResult> {
        Ok(PreHookResult::pass(request))
    }

    /// Observe or rewrite one chunk; returning `None` filters it out
    async fn on_stream_chunk(
        &self,
        _ctx: &PluginContext,
        chunk: ChatChunk,
    ) -> Result<Option<ChatChunk>> {
        Ok(Some(chunk))
    }

    /// Runs LIFO once the stream closes
    async fn post_stream_hook(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }
}

/// Pre-phase output: rewritten request, optional short-circuit, and the
/// number of hooks that actually ran
pub struct PreFlight {
    /// Request after all executed PreHooks
    pub request: UnifiedRequest,
    /// Set when a hook short-circuited
    pub short_circuit: Option<ShortCircuit>,
    /// Hooks executed; the Post phase mirrors exactly this many
    pub run_from: usize,
}

/// Priority-ordered plugin pipeline with pooled contexts
pub struct PluginPipeline {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    settings: PipelineSettings,
    pool: ContextPool,
    shut_down: AtomicBool,
}

impl fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("plugins", &self.plugins.read().len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl PluginPipeline {
    /// Create an empty pipeline
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            settings,
            pool: ContextPool::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a plugin, keeping the sequence priority-sorted
    ///
    /// Rejects duplicate names, registration past `max_plugins`, and
    /// registration after shutdown.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GatewayError::Validation(
                "pipeline is shut down, registration rejected".to_string(),
            ));
        }
        if plugin.name().is_empty() {
            return Err(GatewayError::Validation(
                "plugin name must not be empty".to_string(),
            ));
        }
        let mut plugins = self.plugins.write();
        if plugins.len() >= self.settings.max_plugins {
            return Err(GatewayError::Validation(format!(
                "plugin limit of {} reached",
                self.settings.max_plugins
            )));
        }
        if plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(GatewayError::Validation(format!(
                "plugin {} already registered",
                plugin.name()
            )));
        }
        plugins.push(plugin);
        plugins.sort_by_key(|p| p.priority());
        Ok(())
    }

    /// Registered plugin count
    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    /// Whether no plugins are registered
    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Borrow the context pool
    pub fn context_pool(&self) -> &ContextPool {
        &self.pool
    }

    fn hook_timeout(&self, ctx: &PluginContext, configured: Duration) -> Duration {
        match ctx.remaining() {
            Some(remaining) if remaining < configured => remaining,
            _ => configured,
        }
    }

    fn log_plugin_error(&self, name: &str, hook: &str, error: &GatewayError) {
        if self.settings.propagate_errors {
            warn!(plugin = name, hook, %error, "plugin error (propagation on, informational)");
        } else {
            warn!(plugin = name, hook, %error, "plugin error ignored");
        }
    }

    /// Run PreHooks in ascending priority
    ///
    /// Stops at the first short-circuit; `run_from` records how many
    /// hooks executed either way. A hook that times out is skipped with
    /// a warning and does not abort the request.
    pub async fn run_pre_hooks(&self, ctx: &PluginContext, request: UnifiedRequest) -> PreFlight {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        let timeout = self.hook_timeout(ctx, self.settings.pre_hook_timeout());

        let mut request = request;
        let mut run_from = 0;
        for plugin in &plugins {
            run_from += 1;
            let attempt = request.clone();
            match tokio::time::timeout(timeout, plugin.pre_hook(ctx, attempt)).await {
                Ok(Ok(result)) => {
                    request = result.request;
                    if let Some(short_circuit) = result.short_circuit {
                        debug!(plugin = plugin.name(), "pre-hook short-circuit");
                        return PreFlight {
                            request,
                            short_circuit: Some(short_circuit),
                            run_from,
                        };
                    }
                }
                Ok(Err(error)) => self.log_plugin_error(plugin.name(), "pre_hook", &error),
                Err(_) => warn!(plugin = plugin.name(), "pre-hook timed out, continuing"),
            }
        }
        PreFlight {
            request,
            short_circuit: None,
            run_from,
        }
    }

    /// Run PostHooks in descending priority over the first `run_from`
    /// plugins: the exact mirror of what the Pre phase touched
    pub async fn run_post_hooks(
        &self,
        ctx: &PluginContext,
        run_from: usize,
        outcome: RequestOutcome,
    ) -> RequestOutcome {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        let timeout = self.hook_timeout(ctx, self.settings.post_hook_timeout());

        let mut outcome = outcome;
        for plugin in plugins.iter().take(run_from).rev() {
            let attempt = outcome.clone();
            match tokio::time::timeout(timeout, plugin.post_hook(ctx, attempt)).await {
                Ok(Ok(transformed)) => outcome = transformed,
                Ok(Err(error)) => {
                    // Plugin-internal failure: log and keep the outcome
                    self.log_plugin_error(plugin.name(), "post_hook", &error);
                }
                Err(_) => {
                    warn!(plugin = plugin.name(), "post-hook timed out, continuing");
                }
            }
        }
        outcome
    }

    /// Streaming Pre phase
    ///
    /// Non-streaming plugins are counted (so Post mirrors the count) but
    /// their hooks are skipped.
    pub async fn run_pre_stream_hooks(
        &self,
        ctx: &PluginContext,
        request: UnifiedRequest,
    ) -> PreFlight {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        let timeout = self.hook_timeout(ctx, self.settings.pre_hook_timeout());

        let mut request = request;
        let mut run_from = 0;
        for plugin in &plugins {
            run_from += 1;
            if !plugin.handles_streams() {
                continue;
            }
            let attempt = request.clone();
            match tokio::time::timeout(timeout, plugin.pre_stream_hook(ctx, attempt)).await {
                Ok(Ok(result)) => {
                    request = result.request;
                    if let Some(short_circuit) = result.short_circuit {
                        debug!(plugin = plugin.name(), "pre-stream-hook short-circuit");
                        return PreFlight {
                            request,
                            short_circuit: Some(short_circuit),
                            run_from,
                        };
                    }
                }
                Ok(Err(error)) => self.log_plugin_error(plugin.name(), "pre_stream_hook", &error),
                Err(_) => warn!(plugin = plugin.name(), "pre-stream-hook timed out, continuing"),
            }
        }
        PreFlight {
            request,
            short_circuit: None,
            run_from,
        }
    }

    /// Pass one chunk through `on_stream_chunk` filters in order
    ///
    /// Only plugins the Pre phase reached participate. Returning `None`
    /// filters the chunk out of the client stream.
    pub async fn apply_stream_chunk(
        &self,
        ctx: &PluginContext,
        run_from: usize,
        chunk: ChatChunk,
    ) -> Option<ChatChunk> {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        let timeout = self.hook_timeout(ctx, self.settings.pre_hook_timeout());

        let mut chunk = Some(chunk);
        for plugin in plugins.iter().take(run_from) {
            if !plugin.handles_streams() {
                continue;
            }
            let Some(current) = chunk.take() else {
                break;
            };
            match tokio::time::timeout(timeout, plugin.on_stream_chunk(ctx, current.clone())).await
            {
                Ok(Ok(filtered)) => chunk = filtered,
                Ok(Err(error)) => {
                    self.log_plugin_error(plugin.name(), "on_stream_chunk", &error);
                    chunk = Some(current);
                }
                Err(_) => {
                    warn!(plugin = plugin.name(), "chunk hook timed out, passing through");
                    chunk = Some(current);
                }
            }
        }
        chunk
    }

    /// Run `post_stream_hook` LIFO once the stream closes
    pub async fn run_post_stream_hooks(&self, ctx: &PluginContext, run_from: usize) {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        let timeout = self.hook_timeout(ctx, self.settings.post_hook_timeout());

        for plugin in plugins.iter().take(run_from).rev() {
            if !plugin.handles_streams() {
                continue;
            }
            match tokio::time::timeout(timeout, plugin.post_stream_hook(ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.log_plugin_error(plugin.name(), "post_stream_hook", &error),
                Err(_) => warn!(plugin = plugin.name(), "post-stream-hook timed out"),
            }
        }
    }

    /// Shut the pipeline down: reject further registration and run every
    /// plugin's cleanup
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        for plugin in plugins {
            plugin.cleanup().await;
        }
    }
}

impl Default for PluginPipeline {
    fn default() -> Self {
        Self::new(PipelineSettings::default())
    }
}
