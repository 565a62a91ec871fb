//! Chat completion response and streaming chunk types

use super::chat::{MessageRole, ToolCall};
use serde::{Deserialize, Serialize};

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from the two sides
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Assistant message inside a completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Always `assistant`
    pub role: MessageRole,
    /// Generated content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls issued by the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// One completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index
    pub index: u32,
    /// Generated message
    pub message: ResponseMessage,
    /// Why generation stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Buffered chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion identifier
    pub id: String,
    /// Always `chat.completion`
    pub object: String,
    /// Unix timestamp of creation
    pub created: u64,
    /// Model that produced the completion
    pub model: String,
    /// Completion choices
    pub choices: Vec<Choice>,
    /// Token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Provider fingerprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

impl ChatResponse {
    /// Simple single-choice text response
    pub fn text(id: impl Into<String>, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: MessageRole::Assistant,
                    content: Some(content.into()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
            system_fingerprint: None,
        }
    }

    /// Content of the first choice, if any
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
    }
}

/// Incremental delta in a streaming chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, present only in the first chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    /// Incremental content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Incremental tool calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Tool call delta for streaming function calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Index of the tool call
    pub index: u32,
    /// Tool call ID, first chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool type, first chunk only
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    /// Incremental function payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

/// Function call delta for streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    /// Function name, first chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Incremental arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Choice in a streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// Incremental delta
    pub delta: ChunkDelta,
    /// Set exactly once, on the closing chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Streaming chat completion chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Completion identifier, stable across the stream
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix timestamp of creation
    pub created: u64,
    /// Model that produced the chunk
    pub model: String,
    /// Chunk choices
    pub choices: Vec<ChunkChoice>,
    /// Usage, final chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    /// Content delta chunk
    pub fn content(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        first: bool,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: first.then_some(MessageRole::Assistant),
                    content: Some(content.into()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Closing chunk carrying the finish reason and optional usage
    pub fn finish(
        id: impl Into<String>,
        model: impl Into<String>,
        finish_reason: impl Into<String>,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason.into()),
            }],
            usage,
        }
    }

    /// Content of the first choice's delta, if any
    pub fn delta_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }

    /// Whether any choice carries a finish reason
    pub fn is_final(&self) -> bool {
        self.choices
            .iter()
            .any(|choice| choice.finish_reason.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(10, 25);
        assert_eq!(usage.total_tokens, 35);
    }

    #[test]
    fn test_chunk_helpers() {
        let chunk = ChatChunk::content("chatcmpl-1", "gpt-4", "Hel", true);
        assert_eq!(chunk.delta_content(), Some("Hel"));
        assert!(!chunk.is_final());
        assert_eq!(chunk.choices[0].delta.role, Some(MessageRole::Assistant));

        let done = ChatChunk::finish("chatcmpl-1", "gpt-4", "stop", Some(Usage::new(1, 2)));
        assert!(done.is_final());
        assert_eq!(done.usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn test_response_first_content() {
        let response = ChatResponse::text("chatcmpl-2", "gpt-4", "hello");
        assert_eq!(response.first_content(), Some("hello"));
        assert_eq!(response.object, "chat.completion");
    }
}
