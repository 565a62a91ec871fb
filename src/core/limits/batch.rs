//! Distributed batch rate limiter
//!
//! Caller-side budgets evaluated against a shared store: one atomic
//! script per batch checks a list of `(key, sub_key, limit, kind,
//! window)` descriptors. Gateway replicas sharing a store converge on
//! one budget per key.

use crate::config::rate_limit::{KeyStrategy, RateLimiterConfig};
use crate::core::types::RequestContext;
use crate::utils::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a descriptor counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Request count
    Requests,
    /// Token count
    Tokens,
}

impl LimitKind {
    fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Requests => "requests",
            LimitKind::Tokens => "tokens",
        }
    }
}

/// One window/limit pair to evaluate
#[derive(Debug, Clone)]
pub struct RateLimitDescriptor {
    /// Caller key (API key, user, model, or a combination)
    pub key: String,
    /// Budget dimension under the key (`rpm`, `tpm`)
    pub sub_key: String,
    /// Budget per window
    pub limit: u64,
    /// Counted unit
    pub kind: LimitKind,
    /// Window length in seconds
    pub window_secs: u64,
    /// Amount this request consumes
    pub increment: u64,
}

impl RateLimitDescriptor {
    /// Window and counter names, hash-tagged so both land on one shard
    pub fn storage_names(&self) -> (String, String) {
        let partition = format!("{{{}:{}}}", self.key, self.sub_key);
        (
            format!("{partition}:window"),
            format!("{partition}:counter"),
        )
    }
}

/// Outcome for one descriptor
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the increment fit the budget
    pub allowed: bool,
    /// Counter value after the increment
    pub current: u64,
    /// Budget left in the window
    pub remaining: u64,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

/// Script-granularity store contract
///
/// The whole batch must evaluate atomically: the production backend runs
/// it as one scripted transaction; [`InMemoryRateLimitStore`] holds one
/// lock across the batch.
#[async_trait]
pub trait RateLimitStore: Send + Sync + fmt::Debug {
    /// Evaluate a batch of descriptors atomically
    async fn check_batch(
        &self,
        descriptors: &[RateLimitDescriptor],
    ) -> Result<Vec<RateLimitDecision>>;
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_start: i64,
    count: u64,
}

/// In-memory store: single-process stand-in for the shared backend
///
/// Shared via `Arc`, several gateway instances observe the same windows,
/// which is exactly what the multi-instance tests need.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl InMemoryRateLimitStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_batch(
        &self,
        descriptors: &[RateLimitDescriptor],
    ) -> Result<Vec<RateLimitDecision>> {
        let now = Utc::now().timestamp();
        let mut windows = self.windows.lock();
        let mut decisions = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let (window_name, _counter_name) = descriptor.storage_names();
            let entry = windows.entry(window_name).or_insert(WindowEntry {
                window_start: now,
                count: 0,
            });

            // Expired window: reset both names to (now, increment)
            if now - entry.window_start >= descriptor.window_secs as i64 {
                entry.window_start = now;
                entry.count = 0;
            }
            entry.count += descriptor.increment;

            let allowed = entry.count <= descriptor.limit;
            decisions.push(RateLimitDecision {
                allowed,
                current: entry.count,
                remaining: descriptor.limit.saturating_sub(entry.count),
                reset_at: Utc
                    .timestamp_opt(entry.window_start + descriptor.window_secs as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }

        Ok(decisions)
    }
}

/// Caller-facing limiter: derives descriptors from the configured key
/// strategy and applies the batch verdict
pub struct DistributedRateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn RateLimitStore>,
}

impl fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributedRateLimiter {
    /// Create a limiter over a store
    pub fn new(config: RateLimiterConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { config, store }
    }

    /// Derive the caller key per the configured strategy
    fn caller_key(&self, ctx: &RequestContext, model: &str) -> String {
        let api_key = ctx.api_key_id.as_deref().unwrap_or("anonymous");
        match self.config.key_strategy {
            KeyStrategy::ApiKey => api_key.to_string(),
            KeyStrategy::User => ctx
                .user_id
                .as_deref()
                .unwrap_or(api_key)
                .to_string(),
            KeyStrategy::Model => model.to_string(),
            KeyStrategy::ApiKeyModel => format!("{api_key}:{model}"),
        }
    }

    /// Build the descriptor batch for one request
    pub fn descriptors(
        &self,
        ctx: &RequestContext,
        model: &str,
        input_tokens: u64,
    ) -> SmallVec<[RateLimitDescriptor; 2]> {
        let key = self.caller_key(ctx, model);
        let mut batch = SmallVec::new();
        if self.config.rpm_limit > 0 {
            batch.push(RateLimitDescriptor {
                key: key.clone(),
                sub_key: "rpm".to_string(),
                limit: self.config.rpm_limit,
                kind: LimitKind::Requests,
                window_secs: self.config.window_secs,
                increment: 1,
            });
        }
        if self.config.tpm_limit > 0 {
            batch.push(RateLimitDescriptor {
                key,
                sub_key: "tpm".to_string(),
                limit: self.config.tpm_limit,
                kind: LimitKind::Tokens,
                window_secs: self.config.window_secs,
                increment: input_tokens,
            });
        }
        batch
    }

    /// Admit or reject one request
    ///
    /// Store failures fail open or closed per configuration.
    pub async fn check(
        &self,
        ctx: &RequestContext,
        model: &str,
        input_tokens: u64,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let descriptors = self.descriptors(ctx, model, input_tokens);
        if descriptors.is_empty() {
            return Ok(());
        }

        let decisions = match self.store.check_batch(&descriptors).await {
            Ok(decisions) => decisions,
            Err(err) if self.config.fail_open => {
                warn!(%err, "rate limit store unavailable, failing open");
                return Ok(());
            }
            Err(err) => {
                return Err(GatewayError::Internal(format!(
                    "rate limit store unavailable: {err}"
                )));
            }
        };

        for (descriptor, decision) in descriptors.iter().zip(&decisions) {
            if !decision.allowed {
                debug!(
                    key = %descriptor.key,
                    sub_key = %descriptor.sub_key,
                    current = decision.current,
                    limit = descriptor.limit,
                    "caller rate limit exceeded"
                );
                return Err(GatewayError::RateLimitExceeded(format!(
                    "{} limit of {} {} per {}s exceeded, resets at {}",
                    descriptor.sub_key,
                    descriptor.limit,
                    descriptor.kind.as_str(),
                    descriptor.window_secs,
                    decision.reset_at.to_rfc3339()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u64, tpm: u64) -> RateLimiterConfig {
        RateLimiterConfig {
            enabled: true,
            rpm_limit: rpm,
            tpm_limit: tpm,
            window_secs: 60,
            key_strategy: KeyStrategy::ApiKey,
            fail_open: true,
        }
    }

    #[tokio::test]
    async fn test_rpm_budget_enforced() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = DistributedRateLimiter::new(config(3, 0), store);
        let ctx = RequestContext::new(None).with_api_key("key-1");

        for _ in 0..3 {
            limiter.check(&ctx, "gpt-4", 10).await.unwrap();
        }
        let err = limiter.check(&ctx, "gpt-4", 10).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_tpm_budget_counts_tokens() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = DistributedRateLimiter::new(config(0, 100), store);
        let ctx = RequestContext::new(None).with_api_key("key-1");

        limiter.check(&ctx, "gpt-4", 60).await.unwrap();
        let err = limiter.check(&ctx, "gpt-4", 60).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = DistributedRateLimiter::new(config(1, 0), store);

        let alice = RequestContext::new(None).with_api_key("alice");
        let bob = RequestContext::new(None).with_api_key("bob");
        limiter.check(&alice, "gpt-4", 0).await.unwrap();
        limiter.check(&bob, "gpt-4", 0).await.unwrap();
        assert!(limiter.check(&alice, "gpt-4", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        #[derive(Debug)]
        struct BrokenStore;

        #[async_trait]
        impl RateLimitStore for BrokenStore {
            async fn check_batch(
                &self,
                _descriptors: &[RateLimitDescriptor],
            ) -> Result<Vec<RateLimitDecision>> {
                Err(GatewayError::Internal("store down".into()))
            }
        }

        let ctx = RequestContext::new(None).with_api_key("key-1");

        let open = DistributedRateLimiter::new(config(1, 0), Arc::new(BrokenStore));
        open.check(&ctx, "gpt-4", 0).await.unwrap();

        let mut closed_config = config(1, 0);
        closed_config.fail_open = false;
        let closed = DistributedRateLimiter::new(closed_config, Arc::new(BrokenStore));
        assert!(closed.check(&ctx, "gpt-4", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_storage_names_share_partition() {
        let descriptor = RateLimitDescriptor {
            key: "alice".into(),
            sub_key: "rpm".into(),
            limit: 10,
            kind: LimitKind::Requests,
            window_secs: 60,
            increment: 1,
        };
        let (window, counter) = descriptor.storage_names();
        assert_eq!(window, "{alice:rpm}:window");
        assert_eq!(counter, "{alice:rpm}:counter");
    }
}
