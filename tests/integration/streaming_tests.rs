//! Streaming delivery and mid-stream recovery

use crate::common::{
    MockBehavior, MockService, collect_stream, deployment, gateway, stream_content,
};
use modelmux::GatewayError;
use modelmux::config::{GatewayConfig, RoutingStrategyConfig, StreamRecoveryMode};
use modelmux::core::router::StatsStore;
use modelmux::core::types::{ChatRequest, MessageRole, RequestContext};

fn streaming_request() -> ChatRequest {
    ChatRequest::new("gpt-4")
        .add_user_message("say hello")
        .with_streaming()
}

fn recovery_config(mode: StreamRecoveryMode) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.stream_recovery.mode = mode;
    config.router.retry_count = 2;
    config.router.retry_backoff_ms = 5;
    // Deterministic pick order: unprobed deployments tie-break by id
    config.router.strategy = RoutingStrategyConfig::LowestLatency;
    config
}

#[tokio::test]
async fn test_clean_stream_delivery() {
    let service = MockService::new(MockBehavior::Stream(vec![
        "Hello".into(),
        ", world".into(),
    ]));
    let (orchestrator, _registry, stats, capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("a", "gpt-4", service)],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let (chunks, error) = collect_stream(reply).await;

    assert!(error.is_none());
    assert_eq!(stream_content(&chunks), "Hello, world");
    // Exactly one role header and one finish reason
    let roles = chunks
        .iter()
        .flat_map(|c| &c.choices)
        .filter(|choice| choice.delta.role.is_some())
        .count();
    assert_eq!(roles, 1);
    let finishes = chunks
        .iter()
        .flat_map(|c| &c.choices)
        .filter(|choice| choice.finish_reason.is_some())
        .count();
    assert_eq!(finishes, 1);

    // Stream bookkeeping settled
    let snapshot = stats.snapshot("a").await;
    assert_eq!(snapshot.active_requests, 0);
    assert_eq!(snapshot.success_requests, 1);
    assert!(!snapshot.ttft_history.is_empty(), "TTFT recorded");

    // Streaming invariant: completion_start_time set iff a delta arrived
    assert!(capture.latest().completion_start_time.is_some());
}

#[tokio::test]
async fn test_recovery_retry_mode_splices_second_stream() {
    // A emits two deltas then dies; B streams the full answer
    let a = MockService::new(MockBehavior::StreamThenError(
        vec!["He".into(), "llo".into()],
        GatewayError::ProviderUnavailable("connection reset".into()),
    ));
    let b = MockService::new(MockBehavior::Stream(vec!["Hello, world".into()]));

    let (orchestrator, _registry, stats, capture) = gateway(
        recovery_config(StreamRecoveryMode::Retry),
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let (chunks, error) = collect_stream(reply).await;

    assert!(error.is_none(), "recovered stream must not surface an error");
    assert_eq!(a.call_count(), 1);
    assert_eq!(b.call_count(), 1);
    // B got the original request, unchanged
    assert_eq!(
        b.seen_requests.lock()[0].messages.len(),
        streaming_request().messages.len()
    );

    // One well-formed stream: single role header, single stop
    let roles = chunks
        .iter()
        .flat_map(|c| &c.choices)
        .filter(|choice| choice.delta.role.is_some())
        .count();
    assert_eq!(roles, 1);
    let finishes: Vec<_> = chunks
        .iter()
        .flat_map(|c| &c.choices)
        .filter_map(|choice| choice.finish_reason.clone())
        .collect();
    assert_eq!(finishes, vec!["stop"]);
    assert!(stream_content(&chunks).ends_with("Hello, world"));

    // A cooled and settled; B recorded the success
    assert_eq!(stats.snapshot("a").await.active_requests, 0);
    assert_eq!(stats.snapshot("b").await.success_requests, 1);

    let payload = capture.latest();
    assert_eq!(payload.fallback_events.len(), 1);
    assert_eq!(payload.fallback_events[0].from_deployment, "a");
    assert_eq!(payload.fallback_events[0].to_deployment.as_deref(), Some("b"));
    assert!(payload.fallback_events[0].success);
}

#[tokio::test]
async fn test_recovery_append_mode_carries_partial_message() {
    let a = MockService::new(MockBehavior::StreamThenError(
        vec!["The answer ".into()],
        GatewayError::ProviderUnavailable("upstream died".into()),
    ));
    let b = MockService::new(MockBehavior::Stream(vec!["is 42.".into()]));

    let (orchestrator, _registry, _stats, _capture) = gateway(
        recovery_config(StreamRecoveryMode::Append),
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let (chunks, error) = collect_stream(reply).await;
    assert!(error.is_none());

    // The continuation request carries the accumulated partial
    // assistant message
    let continuation = b.seen_requests.lock()[0].clone();
    let last = continuation.messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(
        last.content.as_ref().map(|c| c.text()).as_deref(),
        Some("The answer ")
    );

    // Client-visible deltas stay continuous, no replayed prefix
    assert_eq!(stream_content(&chunks), "The answer is 42.");
}

#[tokio::test]
async fn test_recovery_off_surfaces_interruption() {
    let a = MockService::new(MockBehavior::StreamThenError(
        vec!["partial".into()],
        GatewayError::ProviderUnavailable("upstream died".into()),
    ));
    let b = MockService::new(MockBehavior::Stream(vec!["never".into()]));

    let (orchestrator, _registry, _stats, capture) = gateway(
        recovery_config(StreamRecoveryMode::Off),
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let (chunks, error) = collect_stream(reply).await;

    assert_eq!(stream_content(&chunks), "partial");
    assert!(matches!(error, Some(GatewayError::StreamInterrupted(_))));
    assert_eq!(b.call_count(), 0, "off mode never reroutes");
    assert_eq!(
        capture.latest().status,
        modelmux::core::telemetry::PayloadStatus::Failure
    );
}

#[tokio::test]
async fn test_over_cap_accumulator_disables_recovery() {
    let a = MockService::new(MockBehavior::StreamThenError(
        vec!["x".repeat(64), "y".repeat(64)],
        GatewayError::ProviderUnavailable("upstream died".into()),
    ));
    let b = MockService::new(MockBehavior::Stream(vec!["spare".into()]));

    let mut config = recovery_config(StreamRecoveryMode::Append);
    config.stream_recovery.max_accumulated_bytes = 100;

    let (orchestrator, _registry, _stats, _capture) = gateway(
        config,
        vec![deployment("a", "gpt-4", a.clone()), deployment("b", "gpt-4", b.clone())],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let (_chunks, error) = collect_stream(reply).await;

    assert!(matches!(error, Some(GatewayError::StreamInterrupted(_))));
    assert_eq!(b.call_count(), 0, "over-cap requests fall back to off");
}

#[tokio::test]
async fn test_ttft_not_reset_by_recovery() {
    let a = MockService::new(MockBehavior::StreamThenError(
        vec!["first".into()],
        GatewayError::ProviderUnavailable("died".into()),
    ));
    let b = MockService::new(MockBehavior::Stream(vec!["second".into()]));

    let (orchestrator, _registry, stats, capture) = gateway(
        recovery_config(StreamRecoveryMode::Retry),
        vec![deployment("a", "gpt-4", a), deployment("b", "gpt-4", b)],
    );

    let ctx = RequestContext::new(None);
    let reply = orchestrator.chat(&ctx, streaming_request()).await.unwrap();
    let started = chrono::Utc::now();
    let (_chunks, error) = collect_stream(reply).await;
    assert!(error.is_none());

    // completion_start_time stems from the first delta of the first
    // stream, before the recovery splice
    let payload = capture.latest();
    let ttft_at = payload.completion_start_time.unwrap();
    assert!(ttft_at <= started + chrono::Duration::seconds(1));

    // The serving deployment recorded exactly one TTFT sample
    assert_eq!(stats.snapshot("b").await.ttft_history.len(), 1);
}
