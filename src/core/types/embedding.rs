//! Embedding request and response types

use super::response::Usage;
use serde::{Deserialize, Serialize};

/// Embedding input: a single string or a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    /// Single input text
    Text(String),
    /// Batch of input texts
    Batch(Vec<String>),
}

impl EmbeddingInput {
    /// Number of input items
    pub fn len(&self) -> usize {
        match self {
            EmbeddingInput::Text(_) => 1,
            EmbeddingInput::Batch(items) => items.len(),
        }
    }

    /// Whether there is no input at all
    pub fn is_empty(&self) -> bool {
        match self {
            EmbeddingInput::Text(text) => text.is_empty(),
            EmbeddingInput::Batch(items) => items.is_empty(),
        }
    }

    /// Total character count, for token estimation
    pub fn char_count(&self) -> usize {
        match self {
            EmbeddingInput::Text(text) => text.len(),
            EmbeddingInput::Batch(items) => items.iter().map(|item| item.len()).sum(),
        }
    }
}

/// Embedding request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Model name (alias or provider-native)
    pub model: String,
    /// Input text(s)
    pub input: EmbeddingInput,
    /// Output encoding (`float` or `base64`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    /// Requested vector dimensions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    /// End-user identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl EmbeddingRequest {
    /// Estimate input token count (character heuristic)
    pub fn estimate_input_tokens(&self) -> u64 {
        (self.input.char_count() as f64 / 4.0).ceil() as u64
    }
}

/// A single embedding vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    /// Always `embedding`
    pub object: String,
    /// Position in the input batch
    pub index: u32,
    /// The vector
    pub embedding: Vec<f32>,
}

/// Embedding response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Always `list`
    pub object: String,
    /// One entry per input item
    pub data: Vec<EmbeddingData>,
    /// Model that produced the vectors
    pub model: String,
    /// Token usage
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_shapes() {
        let single: EmbeddingInput = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(single.len(), 1);

        let batch: EmbeddingInput = serde_json::from_str(r#"["a", "b", "c"]"#).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_token_estimate() {
        let request = EmbeddingRequest {
            model: "embed-small".into(),
            input: EmbeddingInput::Batch(vec!["12345678".into(), "1234".into()]),
            encoding_format: None,
            dimensions: None,
            user: None,
        };
        assert_eq!(request.estimate_input_tokens(), 3);
    }
}
