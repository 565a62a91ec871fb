//! Response cache plugin
//!
//! Short-circuits repeated identical chat requests with a cached
//! response. Honors per-request [`CacheControl`] directives and
//! publishes `cache.hit` / `cache.key` into the plugin context for the
//! telemetry payload.

use super::context::PluginContext;
use super::{Plugin, PreHookResult, RequestOutcome, ShortCircuit};
use crate::config::pipeline::CacheSettings;
use crate::core::providers::{UnifiedRequest, UnifiedResponse};
use crate::core::types::{CacheControl, ChatRequest, ChatResponse};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// Context key flagging a cache hit
pub const CTX_CACHE_HIT: &str = "cache.hit";
/// Context key carrying the computed cache key
pub const CTX_CACHE_KEY: &str = "cache.key";
/// Context key carrying the parsed per-request directives
pub const CTX_CACHE_CONTROL: &str = "cache.control";

/// Pipeline slot: early enough to spare the provider, late enough for
/// auth-style plugins to run first
pub const CACHE_PLUGIN_PRIORITY: i32 = 20;

#[derive(Debug, Clone)]
struct CachedEntry {
    response: ChatResponse,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

/// Caching plugin backed by an in-process async cache
pub struct CachePlugin {
    cache: Cache<String, CachedEntry>,
    settings: CacheSettings,
}

impl CachePlugin {
    /// Create a plugin from cache settings
    pub fn new(settings: CacheSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.max_entries)
            // Entries with a shorter per-request TTL expire logically on
            // read; this bounds physical retention.
            .time_to_live(settings.cache_ttl().max(Duration::from_secs(1)))
            .build();
        Self { cache, settings }
    }

    /// Deterministic key over the response-relevant request fields
    fn cache_key(request: &ChatRequest, namespace: Option<&str>) -> String {
        let canonical = serde_json::json!({
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "top_p": request.top_p,
            "stop": request.stop,
            "tools": request.tools,
            "n": request.n,
        });
        let mut hasher = DefaultHasher::new();
        canonical.to_string().hash(&mut hasher);
        format!(
            "{}:{}:{:016x}",
            namespace.unwrap_or("default"),
            request.model,
            hasher.finish()
        )
    }

    fn entry_ttl(&self, control: &CacheControl) -> Duration {
        control.ttl().unwrap_or_else(|| self.settings.cache_ttl())
    }

    async fn lookup(&self, key: &str, control: &CacheControl) -> Option<ChatResponse> {
        let entry = self.cache.get(key).await?;
        let age = (Utc::now() - entry.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > entry.ttl {
            return None;
        }
        if let Some(max_age) = control.max_age() {
            if age > max_age {
                debug!(key, ?age, "cached entry too old for s-maxage");
                return None;
            }
        }
        Some(entry.response)
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> i32 {
        CACHE_PLUGIN_PRIORITY
    }

    async fn pre_hook(&self, ctx: &PluginContext, request: UnifiedRequest) -> Result<PreHookResult> {
        let UnifiedRequest::Chat(chat) = &request else {
            return Ok(PreHookResult::pass(request));
        };
        // Streamed responses are not buffered, so not cacheable
        if chat.stream {
            return Ok(PreHookResult::pass(request));
        }

        let control = CacheControl::from_extra_params(&chat.extra_params);
        let key = Self::cache_key(chat, control.namespace.as_deref());
        ctx.set(CTX_CACHE_KEY, serde_json::json!(key.clone()));
        ctx.set(CTX_CACHE_HIT, serde_json::json!(false));
        if let Ok(encoded) = serde_json::to_value(&control) {
            ctx.set(CTX_CACHE_CONTROL, encoded);
        }

        if control.no_cache {
            return Ok(PreHookResult::pass(request));
        }

        if let Some(cached) = self.lookup(&key, &control).await {
            debug!(key, "cache hit");
            ctx.set(CTX_CACHE_HIT, serde_json::json!(true));
            return Ok(PreHookResult {
                request,
                short_circuit: Some(ShortCircuit::with_response(UnifiedResponse::Chat(cached))),
            });
        }
        Ok(PreHookResult::pass(request))
    }

    async fn post_hook(
        &self,
        ctx: &PluginContext,
        outcome: RequestOutcome,
    ) -> Result<RequestOutcome> {
        // Only store fresh successful chat responses
        let hit = ctx.get(CTX_CACHE_HIT).and_then(|v| v.as_bool()) == Some(true);
        if hit || outcome.error.is_some() {
            return Ok(outcome);
        }
        let Some(UnifiedResponse::Chat(response)) = &outcome.response else {
            return Ok(outcome);
        };
        let Some(key) = ctx.get(CTX_CACHE_KEY).and_then(|v| v.as_str().map(String::from)) else {
            return Ok(outcome);
        };

        let control = ctx
            .get(CTX_CACHE_CONTROL)
            .and_then(|v| serde_json::from_value::<CacheControl>(v).ok())
            .unwrap_or_default();
        if control.no_store {
            return Ok(outcome);
        }

        self.cache
            .insert(
                key,
                CachedEntry {
                    response: response.clone(),
                    stored_at: Utc::now(),
                    ttl: self.entry_ttl(&control),
                },
            )
            .await;
        Ok(outcome)
    }

    async fn cleanup(&self) {
        self.cache.invalidate_all();
    }
}
