//! Provider adapter contract
//!
//! Adapters translate between the gateway's unified request/response
//! shapes and one vendor's native protocol. The orchestrator never
//! inspects provider-native formats; adapters never touch stats,
//! pipeline, or resilience state. Transport is injected so the core
//! stays testable without a network.

use crate::core::types::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, RequestContext,
    sse,
};
use crate::utils::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use url::Url;

/// Unified request envelope handed to adapters and plugins
#[derive(Debug, Clone)]
pub enum UnifiedRequest {
    /// Chat completion
    Chat(ChatRequest),
    /// Embedding
    Embedding(EmbeddingRequest),
}

impl UnifiedRequest {
    /// Requested model name
    pub fn model(&self) -> &str {
        match self {
            UnifiedRequest::Chat(req) => &req.model,
            UnifiedRequest::Embedding(req) => &req.model,
        }
    }

    /// Overwrite the model name (alias -> provider-native resolution)
    pub fn set_model(&mut self, model: impl Into<String>) {
        match self {
            UnifiedRequest::Chat(req) => req.model = model.into(),
            UnifiedRequest::Embedding(req) => req.model = model.into(),
        }
    }

    /// Cheap input token estimate for budget checks
    pub fn estimate_input_tokens(&self) -> u64 {
        match self {
            UnifiedRequest::Chat(req) => req.estimate_input_tokens(),
            UnifiedRequest::Embedding(req) => req.estimate_input_tokens(),
        }
    }

    /// Whether the caller asked for a streaming response
    pub fn is_streaming(&self) -> bool {
        matches!(self, UnifiedRequest::Chat(req) if req.stream)
    }

    /// End-user identifier, when supplied
    pub fn user(&self) -> Option<&str> {
        match self {
            UnifiedRequest::Chat(req) => req.user.as_deref(),
            UnifiedRequest::Embedding(req) => req.user.as_deref(),
        }
    }
}

/// Unified buffered response envelope
#[derive(Debug, Clone)]
pub enum UnifiedResponse {
    /// Chat completion
    Chat(ChatResponse),
    /// Embedding
    Embedding(EmbeddingResponse),
}

impl UnifiedResponse {
    /// Token usage, when the provider reported it
    pub fn usage(&self) -> Option<crate::core::types::Usage> {
        match self {
            UnifiedResponse::Chat(resp) => resp.usage,
            UnifiedResponse::Embedding(resp) => Some(resp.usage),
        }
    }
}

/// HTTP method for adapter-built requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
}

/// Provider-bound HTTP request built by an adapter
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Full request URL
    pub url: Url,
    /// Header pairs, credentials included
    pub headers: Vec<(String, String)>,
    /// Serialized body
    pub body: Bytes,
}

/// Provider HTTP response handed back to an adapter for parsing
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header pairs
    pub headers: Vec<(String, String)>,
    /// Raw body
    pub body: Bytes,
}

/// Stream of unified chunks flowing to the client
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Raw byte stream from a provider connection
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outcome of one provider invocation
pub enum ProviderResult {
    /// Fully buffered response
    Buffered(UnifiedResponse),
    /// Live chunk stream
    Stream(ChunkStream),
}

impl fmt::Debug for ProviderResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderResult::Buffered(resp) => f.debug_tuple("Buffered").field(resp).finish(),
            ProviderResult::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Translation contract implemented once per vendor protocol
///
/// Implementations are pure translators; they hold credentials and a
/// base URL but perform no I/O themselves.
pub trait ProviderAdapter: Send + Sync + fmt::Debug {
    /// Adapter name, unique across the gateway (`openai`, `anthropic`, ...)
    fn name(&self) -> &'static str;

    /// Whether this adapter can serve the given provider-native model
    fn supports_model(&self, model: &str) -> bool;

    /// Build the provider-bound HTTP request
    fn build_request(&self, ctx: &RequestContext, request: &UnifiedRequest)
    -> Result<HttpRequest>;

    /// Parse a buffered 2xx response
    fn parse_response(&self, response: &HttpResponse) -> Result<UnifiedResponse>;

    /// Parse one SSE data payload into a unified chunk
    ///
    /// Returning `Ok(None)` drops the frame (comments, keep-alives).
    fn parse_stream_chunk(&self, payload: &[u8]) -> Result<Option<ChatChunk>>;

    /// Map a non-2xx status and body to a classified error
    fn map_error(&self, status: u16, body: &str) -> GatewayError;

    /// Whether the embedding surface is implemented
    fn supports_embeddings(&self) -> bool {
        false
    }
}

/// Capability set used for dispatch without runtime type introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Chat completions
    pub chat: bool,
    /// SSE streaming
    pub streaming: bool,
    /// Embeddings
    pub embeddings: bool,
}

/// Transport that actually moves bytes to a provider
///
/// Supplied by the embedding host (or by tests); the core never opens
/// connections itself.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Send a request and buffer the full response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send a request and return the response body as a byte stream
    ///
    /// Called only for 2xx responses; transports surface non-2xx as a
    /// buffered [`HttpResponse`] in the error-carrying variant.
    async fn open_stream(&self, request: HttpRequest) -> Result<TransportStream>;
}

/// Streaming transport outcome: either a live stream or an HTTP error
pub enum TransportStream {
    /// Connection established, body follows
    Open(ByteStream),
    /// Provider answered with a non-2xx status
    Failed(HttpResponse),
}

/// Executable provider surface the orchestrator dispatches on
///
/// [`ProviderClient`] is the production implementation; tests substitute
/// scripted services.
#[async_trait]
pub trait CompletionService: Send + Sync + fmt::Debug {
    /// Run a chat completion, buffered or streaming per the request
    async fn chat(&self, ctx: &RequestContext, request: &ChatRequest) -> Result<ProviderResult>;

    /// Run an embedding request
    async fn embed(
        &self,
        ctx: &RequestContext,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse>;
}

/// Tagged provider handle stored in a deployment
///
/// `(type, opaque handle)` plus the capability set; the orchestrator
/// dispatches purely on these.
#[derive(Clone)]
pub struct ProviderHandle {
    /// Provider type tag (`openai`, `azure`, ...)
    pub provider_type: String,
    /// Capability set
    pub capabilities: AdapterCapabilities,
    /// Opaque executable handle
    pub service: Arc<dyn CompletionService>,
}

impl ProviderHandle {
    /// Wrap a service under a provider type tag
    pub fn new(
        provider_type: impl Into<String>,
        capabilities: AdapterCapabilities,
        service: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            provider_type: provider_type.into(),
            capabilities,
            service,
        }
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("provider_type", &self.provider_type)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Generic provider executor: one adapter plus one transport
///
/// Drives the full adapter contract: build, send, parse, and for
/// streaming responses the SSE line protocol with `[DONE]` handling.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    adapter: Arc<dyn ProviderAdapter>,
    transport: Arc<dyn HttpTransport>,
}

impl ProviderClient {
    /// Pair an adapter with a transport
    pub fn new(adapter: Arc<dyn ProviderAdapter>, transport: Arc<dyn HttpTransport>) -> Self {
        Self { adapter, transport }
    }

    fn map_http_error(&self, response: &HttpResponse) -> GatewayError {
        let body = String::from_utf8_lossy(&response.body);
        self.adapter.map_error(response.status, &body)
    }

    /// Decode an SSE byte stream into unified chunks
    fn decode_stream(&self, bytes: ByteStream) -> ChunkStream {
        let adapter = Arc::clone(&self.adapter);
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            futures::pin_mut!(bytes);
            'outer: while let Some(segment) = bytes.next().await {
                let segment = segment?;
                buffer.push_str(&String::from_utf8_lossy(&segment));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if sse::is_done_line(line) {
                        break 'outer;
                    }
                    if let Some(payload) = sse::parse_sse_line(line) {
                        if let Some(chunk) = adapter.parse_stream_chunk(payload.as_bytes())? {
                            yield chunk;
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

#[async_trait]
impl CompletionService for ProviderClient {
    async fn chat(&self, ctx: &RequestContext, request: &ChatRequest) -> Result<ProviderResult> {
        let unified = UnifiedRequest::Chat(request.clone());
        let http_request = self.adapter.build_request(ctx, &unified)?;

        if request.stream {
            match self.transport.open_stream(http_request).await? {
                TransportStream::Open(bytes) => {
                    Ok(ProviderResult::Stream(self.decode_stream(bytes)))
                }
                TransportStream::Failed(response) => Err(self.map_http_error(&response)),
            }
        } else {
            let response = self.transport.send(http_request).await?;
            if !(200..300).contains(&response.status) {
                return Err(self.map_http_error(&response));
            }
            Ok(ProviderResult::Buffered(
                self.adapter.parse_response(&response)?,
            ))
        }
    }

    async fn embed(
        &self,
        ctx: &RequestContext,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        if !self.adapter.supports_embeddings() {
            return Err(GatewayError::InvalidRequest(format!(
                "provider {} does not support embeddings",
                self.adapter.name()
            )));
        }
        let unified = UnifiedRequest::Embedding(request.clone());
        let http_request = self.adapter.build_request(ctx, &unified)?;
        let response = self.transport.send(http_request).await?;
        if !(200..300).contains(&response.status) {
            return Err(self.map_http_error(&response));
        }
        match self.adapter.parse_response(&response)? {
            UnifiedResponse::Embedding(parsed) => Ok(parsed),
            UnifiedResponse::Chat(_) => Err(GatewayError::Internal(
                "adapter returned a chat response for an embedding request".to_string(),
            )),
        }
    }
}
