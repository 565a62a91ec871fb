//! Shared test fixtures

use async_trait::async_trait;
use futures::StreamExt;
use modelmux::config::GatewayConfig;
use modelmux::core::orchestrator::{GatewayReply, OrchestratorBuilder, RequestOrchestrator};
use modelmux::core::providers::{
    AdapterCapabilities, ChunkStream, CompletionService, ProviderHandle, ProviderResult,
};
use modelmux::core::router::{Deployment, DeploymentRegistry, LocalStatsStore};
use modelmux::core::telemetry::{StandardLoggingPayload, TelemetryCallback};
use modelmux::core::types::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingData, EmbeddingRequest, EmbeddingResponse,
    RequestContext, Usage,
};
use modelmux::{GatewayError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted provider reaction
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Buffered success with the given content
    Reply(String),
    /// Immediate failure
    Fail(GatewayError),
    /// Failure derived from an upstream HTTP status
    FailStatus(u16),
    /// Never answer (exercises attempt deadlines)
    Hang,
    /// Stream the fragments, then finish cleanly
    Stream(Vec<String>),
    /// Stream the fragments, then fail mid-stream
    StreamThenError(Vec<String>, GatewayError),
}

/// Scripted [`CompletionService`]
///
/// Pops one behavior per call, falling back to the last scripted entry
/// once the queue drains. Records every chat request it saw.
#[derive(Debug)]
pub struct MockService {
    script: Mutex<VecDeque<MockBehavior>>,
    fallback: MockBehavior,
    pub calls: AtomicUsize,
    pub seen_requests: Mutex<Vec<ChatRequest>>,
}

impl MockService {
    pub fn new(fallback: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            seen_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(behaviors: Vec<MockBehavior>, fallback: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(behaviors.into()),
            fallback,
            calls: AtomicUsize::new(0),
            seen_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn chunk_stream(model: &str, fragments: Vec<String>, error: Option<GatewayError>) -> ChunkStream {
        let model = model.to_string();
        let mut items: Vec<Result<ChatChunk>> = Vec::new();
        for (index, fragment) in fragments.iter().enumerate() {
            items.push(Ok(ChatChunk::content(
                "chatcmpl-mock",
                &model,
                fragment.clone(),
                index == 0,
            )));
        }
        match error {
            Some(error) => items.push(Err(error)),
            None => items.push(Ok(ChatChunk::finish(
                "chatcmpl-mock",
                &model,
                "stop",
                Some(Usage::new(5, 7)),
            ))),
        }
        Box::pin(futures::stream::iter(items))
    }
}

#[async_trait]
impl CompletionService for MockService {
    async fn chat(&self, _ctx: &RequestContext, request: &ChatRequest) -> Result<ProviderResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_requests.lock().push(request.clone());
        match self.next_behavior() {
            MockBehavior::Reply(content) => {
                let mut response = ChatResponse::text("chatcmpl-mock", &request.model, content);
                response.usage = Some(Usage::new(10, 20));
                Ok(ProviderResult::Buffered(
                    modelmux::core::providers::UnifiedResponse::Chat(response),
                ))
            }
            MockBehavior::Fail(error) => Err(error),
            MockBehavior::FailStatus(status) => {
                Err(GatewayError::from_status(status, "scripted failure"))
            }
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::Internal("unreachable".into()))
            }
            MockBehavior::Stream(fragments) => Ok(ProviderResult::Stream(Self::chunk_stream(
                &request.model,
                fragments,
                None,
            ))),
            MockBehavior::StreamThenError(fragments, error) => Ok(ProviderResult::Stream(
                Self::chunk_stream(&request.model, fragments, Some(error)),
            )),
        }
    }

    async fn embed(
        &self,
        _ctx: &RequestContext,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            MockBehavior::Fail(error) => Err(error),
            MockBehavior::FailStatus(status) => {
                Err(GatewayError::from_status(status, "scripted failure"))
            }
            _ => Ok(EmbeddingResponse {
                object: "list".to_string(),
                data: vec![EmbeddingData {
                    object: "embedding".to_string(),
                    index: 0,
                    embedding: vec![0.1, 0.2, 0.3, 0.4],
                }],
                model: request.model.clone(),
                usage: Usage::new(6, 0),
            }),
        }
    }
}

/// Wrap a service into a deployment
pub fn deployment(id: &str, alias: &str, service: Arc<MockService>) -> Deployment {
    let handle = ProviderHandle::new(
        "openai",
        AdapterCapabilities {
            chat: true,
            streaming: true,
            embeddings: true,
        },
        service,
    );
    Deployment::new(id, format!("{alias}-native"), handle).with_alias(alias)
}

/// Telemetry callback capturing every payload
#[derive(Debug, Default)]
pub struct CapturingCallback {
    pub payloads: Mutex<Vec<Arc<StandardLoggingPayload>>>,
}

impl CapturingCallback {
    pub fn latest(&self) -> Arc<StandardLoggingPayload> {
        self.payloads.lock().last().cloned().expect("a payload")
    }
}

#[async_trait]
impl TelemetryCallback for CapturingCallback {
    fn name(&self) -> &str {
        "capturing"
    }

    async fn on_request(&self, payload: Arc<StandardLoggingPayload>) -> Result<()> {
        self.payloads.lock().push(payload);
        Ok(())
    }
}

/// Fully wired gateway over the given deployments
pub fn gateway(
    config: GatewayConfig,
    deployments: Vec<Deployment>,
) -> (
    RequestOrchestrator,
    Arc<DeploymentRegistry>,
    Arc<LocalStatsStore>,
    Arc<CapturingCallback>,
) {
    let registry = Arc::new(DeploymentRegistry::new());
    for deployment in deployments {
        registry.register(deployment);
    }
    let stats = Arc::new(LocalStatsStore::new(config.router.ewma_alpha));
    let callbacks = Arc::new(modelmux::core::telemetry::CallbackManager::new());
    let capture = Arc::new(CapturingCallback::default());
    callbacks.register(capture.clone());

    let orchestrator = OrchestratorBuilder::new(config, registry.clone(), stats.clone())
        .callbacks(callbacks)
        .build();
    (orchestrator, registry, stats, capture)
}

/// Drain a streaming reply into its chunks and terminal error
pub async fn collect_stream(reply: GatewayReply) -> (Vec<ChatChunk>, Option<GatewayError>) {
    let GatewayReply::Stream(mut stream) = reply else {
        panic!("expected a streaming reply");
    };
    let mut chunks = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }
    (chunks, error)
}

/// Concatenated content of a chunk sequence
pub fn stream_content(chunks: &[ChatChunk]) -> String {
    chunks
        .iter()
        .filter_map(|chunk| chunk.delta_content())
        .collect()
}
