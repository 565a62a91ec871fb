//! Orchestrator fallback, cancellation, and telemetry assembly

use crate::common::{MockBehavior, MockService, deployment, gateway};
use modelmux::GatewayError;
use modelmux::config::GatewayConfig;
use modelmux::core::orchestrator::GatewayReply;
use modelmux::core::router::StatsStore;
use modelmux::core::telemetry::PayloadStatus;
use modelmux::core::types::{ChatRequest, EmbeddingInput, EmbeddingRequest, RequestContext};

fn expect_completion(reply: GatewayReply) -> modelmux::core::types::ChatResponse {
    match reply {
        GatewayReply::Completion(response) => response,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_on_timeout_reaches_second_deployment() {
    // A hangs past the attempt deadline; B answers
    let a = MockService::new(MockBehavior::Hang);
    let b = MockService::new(MockBehavior::Reply("answer from b".into()));

    let mut config = GatewayConfig::default();
    config.router.retry_count = 2;
    config.router.retry_backoff_ms = 10;
    config.router.attempt_timeout_ms = 150;
    // Deterministic first pick: lowest-latency probes unprobed
    // deployments in id order
    config.router.strategy = modelmux::config::RoutingStrategyConfig::LowestLatency;

    let (orchestrator, _registry, stats, capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let response = expect_completion(
        orchestrator
            .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hello"))
            .await
            .unwrap(),
    );
    assert_eq!(response.first_content(), Some("answer from b"));
    assert_eq!(a.call_count(), 1);
    assert_eq!(b.call_count(), 1);

    // Fallback event (a -> b, timeout, success)
    let payload = capture.latest();
    assert_eq!(payload.status, PayloadStatus::Success);
    assert_eq!(payload.fallback_events.len(), 1);
    let event = &payload.fallback_events[0];
    assert_eq!(event.from_deployment, "a");
    assert_eq!(event.to_deployment.as_deref(), Some("b"));
    assert!(event.success);
    assert!(event.error.to_lowercase().contains("timeout"));

    // Timeout penalty: A cooled, with the synthetic latency sample
    let snapshot = stats.snapshot("a").await;
    assert!(snapshot.in_cooldown(chrono::Utc::now()));
    assert_eq!(*snapshot.latency_history.back().unwrap(), 1_000_000.0);
    assert_eq!(snapshot.active_requests, 0);
}

#[tokio::test]
async fn test_auth_errors_bubble_up_without_retry() {
    let a = MockService::new(MockBehavior::FailStatus(401));
    let b = MockService::new(MockBehavior::Reply("never".into()));

    let mut config = GatewayConfig::default();
    config.router.retry_count = 3;
    config.router.strategy = modelmux::config::RoutingStrategyConfig::LowestLatency;

    let (orchestrator, _registry, _stats, capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let err = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Authentication(_)));
    assert_eq!(err.http_status(), 401);
    assert_eq!(b.call_count(), 0, "auth failures never reroute");

    let payload = capture.latest();
    assert_eq!(payload.status, PayloadStatus::Failure);
    assert_eq!(payload.error_kind.as_deref(), Some("authentication"));
}

#[tokio::test]
async fn test_context_length_errors_surface_without_retry() {
    let a = MockService::new(MockBehavior::Fail(GatewayError::ContextLength(
        "prompt too long".into(),
    )));
    let b = MockService::new(MockBehavior::Reply("never".into()));

    let mut config = GatewayConfig::default();
    config.router.retry_count = 3;
    config.router.strategy = modelmux::config::RoutingStrategyConfig::LowestLatency;

    let (orchestrator, _registry, stats, _capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let err = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ContextLength(_)));
    assert_eq!(b.call_count(), 0, "client-fault errors never reroute");
    // Not the deployment's fault either: no cooldown
    assert!(!stats.snapshot("a").await.in_cooldown(chrono::Utc::now()));
}

#[tokio::test]
async fn test_all_attempts_failing_surfaces_last_error() {
    let a = MockService::new(MockBehavior::FailStatus(503));
    let b = MockService::new(MockBehavior::FailStatus(503));

    let mut config = GatewayConfig::default();
    config.router.retry_count = 1;
    config.router.retry_backoff_ms = 5;

    let (orchestrator, _registry, stats, capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let err = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ProviderUnavailable(_)));
    assert_eq!(a.call_count() + b.call_count(), 2);

    let payload = capture.latest();
    assert_eq!(payload.status, PayloadStatus::Failure);
    // One transition per deployment change, the final one unsuccessful
    assert!(!payload.fallback_events.is_empty());
    assert!(!payload.fallback_events.last().unwrap().success);

    // Both deployments settled their in-flight counters
    assert_eq!(stats.snapshot("a").await.active_requests, 0);
    assert_eq!(stats.snapshot("b").await.active_requests, 0);
}

#[tokio::test]
async fn test_cancellation_skips_cooldown() {
    let a = MockService::new(MockBehavior::Hang);

    let mut config = GatewayConfig::default();
    config.router.retry_count = 2;

    let (orchestrator, _registry, stats, capture) =
        gateway(config, vec![deployment("a", "gpt-4", a.clone())]);

    let ctx = RequestContext::new(None);
    let cancel = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled(_)));

    // Cancellation is not a deployment fault: counters settle, no cooldown
    let snapshot = stats.snapshot("a").await;
    assert_eq!(snapshot.active_requests, 0);
    assert!(!snapshot.in_cooldown(chrono::Utc::now()));

    // Telemetry still fired
    assert_eq!(capture.latest().status, PayloadStatus::Failure);
}

#[tokio::test]
async fn test_unknown_model_is_a_clean_no_deployment_error() {
    let (orchestrator, _registry, _stats, _capture) =
        gateway(GatewayConfig::default(), Vec::new());
    let ctx = RequestContext::new(None);
    let err = orchestrator
        .chat(&ctx, ChatRequest::new("missing").add_user_message("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoAvailableDeployment(_)));
}

#[tokio::test]
async fn test_embedding_path() {
    let service = MockService::new(MockBehavior::Reply("unused".into()));
    let (orchestrator, _registry, stats, capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("e1", "embed-small", service)],
    );

    let ctx = RequestContext::new(None);
    let response = orchestrator
        .embed(
            &ctx,
            EmbeddingRequest {
                model: "embed-small".to_string(),
                input: EmbeddingInput::Text("embed me".to_string()),
                encoding_format: None,
                dimensions: None,
                user: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.data.len(), 1);
    assert_eq!(response.data[0].embedding.len(), 4);

    let snapshot = stats.snapshot("e1").await;
    assert_eq!(snapshot.success_requests, 1);
    assert_eq!(snapshot.active_requests, 0);

    let payload = capture.latest();
    assert_eq!(
        payload.call_type,
        modelmux::core::telemetry::CallType::Embedding
    );
    assert_eq!(payload.prompt_tokens, 6);
}

#[tokio::test]
async fn test_request_id_echoed_in_payload() {
    let service = MockService::new(MockBehavior::Reply("ok".into()));
    let (orchestrator, _registry, _stats, capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("d1", "gpt-4", service)],
    );

    // Valid client id is adopted
    let ctx = RequestContext::new(Some("client-supplied.id-1"));
    orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
        .await
        .unwrap();
    assert_eq!(capture.latest().id, "client-supplied.id-1");

    // Malformed id is replaced by 128-bit hex
    let ctx = RequestContext::new(Some("bad id!"));
    orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
        .await
        .unwrap();
    let substituted = capture.latest().id.clone();
    assert_eq!(substituted.len(), 32);
    assert!(substituted.chars().all(|c| c.is_ascii_hexdigit()));
}
