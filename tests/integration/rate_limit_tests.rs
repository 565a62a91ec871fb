//! Distributed caller budgets across gateway instances

use crate::common::{MockBehavior, MockService, deployment};
use modelmux::GatewayError;
use modelmux::config::{GatewayConfig, KeyStrategy, RateLimiterConfig};
use modelmux::core::limits::{DistributedRateLimiter, InMemoryRateLimitStore};
use modelmux::core::orchestrator::{OrchestratorBuilder, RequestOrchestrator};
use modelmux::core::router::{DeploymentRegistry, LocalStatsStore};
use modelmux::core::types::{ChatRequest, RequestContext};
use std::sync::Arc;

fn instance(
    store: Arc<InMemoryRateLimitStore>,
    rate_config: RateLimiterConfig,
) -> RequestOrchestrator {
    let registry = Arc::new(DeploymentRegistry::new());
    registry.register(deployment(
        "d1",
        "gpt-4",
        MockService::new(MockBehavior::Reply("ok".into())),
    ));
    let stats = Arc::new(LocalStatsStore::default());
    let limiter = Arc::new(DistributedRateLimiter::new(rate_config, store));
    OrchestratorBuilder::new(GatewayConfig::default(), registry, stats)
        .rate_limiter(limiter)
        .build()
}

#[tokio::test]
async fn test_shared_rpm_budget_across_two_instances() {
    let store = Arc::new(InMemoryRateLimitStore::new());
    let rate_config = RateLimiterConfig {
        enabled: true,
        rpm_limit: 10,
        tpm_limit: 0,
        window_secs: 60,
        key_strategy: KeyStrategy::ApiKey,
        fail_open: true,
    };
    let gateway_a = instance(store.clone(), rate_config.clone());
    let gateway_b = instance(store, rate_config);

    let ctx = RequestContext::new(None).with_api_key("shared-key");
    let request = ChatRequest::new("gpt-4").add_user_message("hi");

    let mut allowed = 0;
    let mut denied = 0;
    for index in 0..15 {
        let orchestrator = if index % 2 == 0 { &gateway_a } else { &gateway_b };
        match orchestrator.chat(&ctx, request.clone()).await {
            Ok(_) => allowed += 1,
            Err(GatewayError::RateLimitExceeded(message)) => {
                denied += 1;
                // reset_at lands inside the current window
                assert!(message.contains("resets at"));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(allowed, 10, "exactly the shared budget is admitted");
    assert_eq!(denied, 5);
}

#[tokio::test]
async fn test_tpm_budget_denies_large_requests() {
    let store = Arc::new(InMemoryRateLimitStore::new());
    let rate_config = RateLimiterConfig {
        enabled: true,
        rpm_limit: 0,
        tpm_limit: 25,
        window_secs: 60,
        key_strategy: KeyStrategy::ApiKey,
        fail_open: true,
    };
    let gateway = instance(store, rate_config);

    let ctx = RequestContext::new(None).with_api_key("token-key");
    // 10 estimated tokens per request: two fit in 25, the third does not
    let request = ChatRequest::new("gpt-4").add_user_message("some words to count here");

    gateway.chat(&ctx, request.clone()).await.unwrap();
    gateway.chat(&ctx, request.clone()).await.unwrap();
    let err = gateway.chat(&ctx, request).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimitExceeded(_)));
}

#[tokio::test]
async fn test_key_strategies_scope_budgets() {
    let store = Arc::new(InMemoryRateLimitStore::new());
    let rate_config = RateLimiterConfig {
        enabled: true,
        rpm_limit: 1,
        tpm_limit: 0,
        window_secs: 60,
        key_strategy: KeyStrategy::ApiKeyModel,
        fail_open: true,
    };
    let gateway = instance(store, rate_config);
    let request = ChatRequest::new("gpt-4").add_user_message("hi");

    // Same key + model: second request denied
    let alice = RequestContext::new(None).with_api_key("alice");
    gateway.chat(&alice, request.clone()).await.unwrap();
    assert!(gateway.chat(&alice, request.clone()).await.is_err());

    // Different key: separate budget
    let bob = RequestContext::new(None).with_api_key("bob");
    gateway.chat(&bob, request).await.unwrap();
}
