//! Wire model and request-scoped types
//!
//! OpenAI-compatible chat and embedding shapes, SSE framing, request id
//! handling, and the per-request context.

pub mod cache_control;
pub mod chat;
pub mod context;
pub mod embedding;
pub mod request_id;
pub mod response;
pub mod sse;

pub use cache_control::CacheControl;
pub use chat::{
    ChatMessage, ChatRequest, ContentPart, FunctionCall, FunctionDefinition, ImageUrl,
    MessageContent, MessageRole, Tool, ToolCall,
};
pub use context::RequestContext;
pub use embedding::{EmbeddingData, EmbeddingInput, EmbeddingRequest, EmbeddingResponse};
pub use request_id::{effective_request_id, generate_request_id, validate_request_id};
pub use response::{
    ChatChunk, ChatResponse, Choice, ChunkChoice, ChunkDelta, FunctionCallDelta, ResponseMessage,
    ToolCallDelta, Usage,
};
