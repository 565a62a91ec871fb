//! Routing fairness and cooldown behavior

use crate::common::{MockBehavior, MockService, deployment, gateway};
use modelmux::config::{GatewayConfig, RoutingStrategyConfig};
use modelmux::core::router::{
    Deployment, DeploymentRegistry, LocalStatsStore, Router, RoutingStrategy, StatsStore,
};
use modelmux::core::types::{ChatRequest, RequestContext};
use std::collections::HashMap;
use std::sync::Arc;

fn weighted_deployment(id: &str, weight: u32) -> Deployment {
    let mut d = deployment(id, "gpt-4", MockService::new(MockBehavior::Reply("ok".into())));
    d.config.weight = weight;
    d
}

#[tokio::test]
async fn test_weighted_shuffle_fairness() {
    let registry = Arc::new(DeploymentRegistry::new());
    registry.register(weighted_deployment("heavy", 3));
    registry.register(weighted_deployment("light", 1));
    let stats = Arc::new(LocalStatsStore::default());
    let router = Router::new(registry, stats, RoutingStrategy::SimpleShuffle);

    let mut counts: HashMap<String, u32> = HashMap::new();
    let rounds = 10_000;
    for _ in 0..rounds {
        let picked = router.pick("gpt-4", &[], 0).await.unwrap();
        *counts.entry(picked.id).or_default() += 1;
    }

    // Weights 3:1 over 10k picks: expect 7500/2500 within 5% of total
    let heavy = counts["heavy"] as f64;
    let light = counts["light"] as f64;
    assert!(
        (heavy - 7500.0).abs() < 500.0,
        "heavy got {heavy}, expected ~7500"
    );
    assert!(
        (light - 2500.0).abs() < 500.0,
        "light got {light}, expected ~2500"
    );
}

#[tokio::test]
async fn test_cooldown_on_429_excludes_then_recovers() {
    // X answers 429 once, then would answer fine; Y always healthy
    let x = MockService::scripted(
        vec![MockBehavior::FailStatus(429)],
        MockBehavior::Reply("from x".into()),
    );
    let y = MockService::new(MockBehavior::Reply("from y".into()));

    let mut config = GatewayConfig::default();
    config.router.cooldown_period_secs = 1;
    config.router.retry_count = 1;

    let (orchestrator, _registry, stats, _capture) = gateway(
        config,
        vec![
            deployment("x", "gpt-4", x.clone()),
            deployment("y", "gpt-4", y.clone()),
        ],
    );

    // Drive requests until X has failed once
    let ctx = RequestContext::new(None);
    let request = ChatRequest::new("gpt-4").add_user_message("hi");
    while x.call_count() == 0 {
        let _ = orchestrator.chat(&ctx, request.clone()).await;
    }
    assert!(
        stats
            .snapshot("x")
            .await
            .in_cooldown(chrono::Utc::now()),
        "429 must cool X down immediately"
    );

    // Within the cooldown window every request lands on Y
    let x_calls = x.call_count();
    for _ in 0..5 {
        let reply = orchestrator.chat(&ctx, request.clone()).await.unwrap();
        match reply {
            modelmux::core::orchestrator::GatewayReply::Completion(resp) => {
                assert_eq!(resp.first_content(), Some("from y"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }
    assert_eq!(x.call_count(), x_calls, "X must not be called while cooling");

    // After the period plus a margin, X is eligible again
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert!(
        !stats.snapshot("x").await.in_cooldown(chrono::Utc::now()),
        "cooldown expires by time alone"
    );
}

#[tokio::test]
async fn test_round_robin_strategy_from_config() {
    let a = MockService::new(MockBehavior::Reply("a".into()));
    let b = MockService::new(MockBehavior::Reply("b".into()));

    let mut config = GatewayConfig::default();
    config.router.strategy = RoutingStrategyConfig::RoundRobin;

    let (orchestrator, _registry, _stats, _capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    for _ in 0..4 {
        orchestrator
            .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
            .await
            .unwrap();
    }
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.call_count(), 2);
}

#[tokio::test]
async fn test_active_requests_balanced_after_traffic() {
    let service = MockService::new(MockBehavior::Reply("ok".into()));
    let (orchestrator, _registry, stats, _capture) =
        gateway(GatewayConfig::default(), vec![deployment("d1", "gpt-4", service)]);

    let ctx = RequestContext::new(None);
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let orchestrator = orchestrator.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = stats.snapshot("d1").await;
    assert_eq!(snapshot.active_requests, 0, "starts and ends must balance");
    assert_eq!(snapshot.total_requests, 16);
    assert_eq!(
        snapshot.total_requests,
        snapshot.success_requests + snapshot.fail_requests
    );
}
