//! Pipeline behavior through the orchestrator

use crate::common::{MockBehavior, MockService, deployment, gateway};
use async_trait::async_trait;
use modelmux::Result;
use modelmux::config::GatewayConfig;
use modelmux::core::orchestrator::GatewayReply;
use modelmux::core::pipeline::{
    Plugin, PluginContext, PreHookResult, RequestOutcome, ShortCircuit,
};
use modelmux::core::providers::{UnifiedRequest, UnifiedResponse};
use modelmux::core::types::{ChatRequest, ChatResponse, RequestContext};
use parking_lot::Mutex;
use std::sync::Arc;

/// Traces hook execution order; optionally short-circuits
struct TracingPlugin {
    name: String,
    priority: i32,
    trace: Arc<Mutex<Vec<String>>>,
    short_circuit_with: Option<String>,
}

#[async_trait]
impl Plugin for TracingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_hook(
        &self,
        _ctx: &PluginContext,
        request: UnifiedRequest,
    ) -> Result<PreHookResult> {
        self.trace.lock().push(format!("pre:{}", self.name));
        if let Some(content) = &self.short_circuit_with {
            return Ok(PreHookResult {
                request,
                short_circuit: Some(ShortCircuit::with_response(UnifiedResponse::Chat(
                    ChatResponse::text("cached-id", "gpt-4", content.clone()),
                ))),
            });
        }
        Ok(PreHookResult::pass(request))
    }

    async fn post_hook(
        &self,
        _ctx: &PluginContext,
        outcome: RequestOutcome,
    ) -> Result<RequestOutcome> {
        self.trace.lock().push(format!("post:{}", self.name));
        Ok(outcome)
    }
}

fn plugin(
    name: &str,
    priority: i32,
    trace: &Arc<Mutex<Vec<String>>>,
    short_circuit_with: Option<&str>,
) -> Arc<dyn Plugin> {
    Arc::new(TracingPlugin {
        name: name.to_string(),
        priority,
        trace: trace.clone(),
        short_circuit_with: short_circuit_with.map(str::to_string),
    })
}

#[tokio::test]
async fn test_short_circuit_skips_provider_and_mirrors_lifo() {
    let service = MockService::new(MockBehavior::Reply("from provider".into()));
    let (orchestrator, _registry, _stats, _capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("d1", "gpt-4", service.clone())],
    );

    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = orchestrator.pipeline();
    pipeline.register(plugin("p10", 10, &trace, None)).unwrap();
    pipeline
        .register(plugin("p20", 20, &trace, Some("cached response")))
        .unwrap();
    pipeline.register(plugin("p30", 30, &trace, None)).unwrap();

    let ctx = RequestContext::new(None);
    let reply = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
        .await
        .unwrap();

    // The short-circuit response comes back to the caller
    match reply {
        GatewayReply::Completion(response) => {
            assert_eq!(response.first_content(), Some("cached response"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    // The provider was never invoked
    assert_eq!(service.call_count(), 0);
    // Pre(10), Pre(20) short-circuits; Post(20), Post(10); p30 untouched
    assert_eq!(
        *trace.lock(),
        vec!["pre:p10", "pre:p20", "post:p20", "post:p10"]
    );
}

#[tokio::test]
async fn test_pre_and_post_are_exact_mirrors_on_full_run() {
    let service = MockService::new(MockBehavior::Reply("answer".into()));
    let (orchestrator, _registry, _stats, _capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("d1", "gpt-4", service)],
    );

    let trace = Arc::new(Mutex::new(Vec::new()));
    let pipeline = orchestrator.pipeline();
    pipeline.register(plugin("p30", 30, &trace, None)).unwrap();
    pipeline.register(plugin("p10", 10, &trace, None)).unwrap();
    pipeline.register(plugin("p20", 20, &trace, None)).unwrap();

    let ctx = RequestContext::new(None);
    orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
        .await
        .unwrap();

    let recorded = trace.lock().clone();
    let pre: Vec<&String> = recorded.iter().filter(|e| e.starts_with("pre:")).collect();
    let post: Vec<&String> = recorded.iter().filter(|e| e.starts_with("post:")).collect();
    assert_eq!(pre.len(), post.len());
    // Post is the reverse of Pre
    for (pre_entry, post_entry) in pre.iter().zip(post.iter().rev()) {
        assert_eq!(pre_entry["pre:".len()..], post_entry["post:".len()..]);
    }
    assert_eq!(pre, vec!["pre:p10", "pre:p20", "pre:p30"]);
}

#[tokio::test]
async fn test_post_hook_recovery_turns_failure_into_success() {
    struct RescuePlugin;

    #[async_trait]
    impl Plugin for RescuePlugin {
        fn name(&self) -> &str {
            "rescue"
        }
        fn priority(&self) -> i32 {
            10
        }
        async fn post_hook(
            &self,
            _ctx: &PluginContext,
            outcome: RequestOutcome,
        ) -> Result<RequestOutcome> {
            if outcome.error.is_some() {
                return Ok(RequestOutcome::ok(UnifiedResponse::Chat(
                    ChatResponse::text("rescued", "gpt-4", "degraded but alive"),
                )));
            }
            Ok(outcome)
        }
    }

    let service = MockService::new(MockBehavior::FailStatus(503));
    let mut config = GatewayConfig::default();
    config.router.retry_count = 0;
    let (orchestrator, _registry, _stats, _capture) =
        gateway(config, vec![deployment("d1", "gpt-4", service)]);
    orchestrator.pipeline().register(Arc::new(RescuePlugin)).unwrap();

    let ctx = RequestContext::new(None);
    let reply = orchestrator
        .chat(&ctx, ChatRequest::new("gpt-4").add_user_message("hi"))
        .await
        .unwrap();
    match reply {
        GatewayReply::Completion(response) => {
            assert_eq!(response.first_content(), Some("degraded but alive"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cache_plugin_end_to_end() {
    let service = MockService::new(MockBehavior::Reply("fresh answer".into()));
    let (orchestrator, _registry, _stats, capture) = gateway(
        GatewayConfig::default(),
        vec![deployment("d1", "gpt-4", service.clone())],
    );
    orchestrator
        .pipeline()
        .register(Arc::new(modelmux::core::pipeline::CachePlugin::new(
            modelmux::config::CacheSettings::default(),
        )))
        .unwrap();

    let ctx = RequestContext::new(None);
    let request = ChatRequest::new("gpt-4").add_user_message("what is up");

    orchestrator.chat(&ctx, request.clone()).await.unwrap();
    assert_eq!(service.call_count(), 1);
    assert!(!capture.latest().cache_hit);

    // Identical request: served from cache, provider untouched
    let reply = orchestrator.chat(&ctx, request.clone()).await.unwrap();
    assert_eq!(service.call_count(), 1);
    match reply {
        GatewayReply::Completion(response) => {
            assert_eq!(response.first_content(), Some("fresh answer"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    let payload = capture.latest();
    assert!(payload.cache_hit);
    assert!(payload.cache_key.is_some());
}
