//! LLM and embeddings ports.
//!
//! Everything upstream of these traits is provider-agnostic: the pipeline
//! sees `complete` / `route_query` / `stream_generate` and never a concrete
//! API shape. The Gemini implementation lives in [`gemini`]; tests use
//! hand-rolled fakes.

pub mod embeddings;
pub mod gemini;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use embeddings::{cosine_similarity, sparse_similarity, EmbeddingClient, SparseVector};
pub use gemini::GeminiClient;

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token counts reported by (or estimated for) one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Incremental generation output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A chunk of answer text.
    Chunk(String),
    /// Usage metadata; arrives at most once, at the end of the stream.
    Usage(TokenUsage),
}

/// Structured output of the query router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRouting {
    /// True when the query relies on chat history to be understood.
    pub is_dependent: bool,
    /// The fully contextualized query; equals the input when standalone.
    pub standalone_query: String,
}

/// Inputs for a grounded generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fixed system instruction.
    pub system: String,
    /// Retrieved context, already formatted as one block.
    pub context: String,
    /// Effective conversation history.
    pub history: Vec<ChatMessage>,
    /// The user's (sanitized) question.
    pub user: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Streaming delta sequence for one generation.
pub type GenerationStream = BoxStream<'static, Result<StreamDelta>>;

/// Narrow LLM port.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, also the key into the price table.
    fn model(&self) -> &str;

    /// Short non-streaming completion (short-query expansion and similar).
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Structured routing call returning `{is_dependent, standalone_query}`.
    async fn route_query(&self, system: &str, user: &str) -> Result<QueryRouting>;

    /// Stream a grounded answer. The final item should be a
    /// [`StreamDelta::Usage`] when the provider reports token counts.
    async fn stream_generate(&self, request: GenerationRequest) -> Result<GenerationStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::user("hi").role, Role::User);
        assert_eq!(ChatMessage::assistant("yo").role, Role::Assistant);
    }

    #[test]
    fn test_query_routing_deserializes_from_structured_output() {
        let json = r#"{"is_dependent": true, "standalone_query": "what is mweb"}"#;
        let routing: QueryRouting = serde_json::from_str(json).unwrap();
        assert!(routing.is_dependent);
        assert_eq!(routing.standalone_query, "what is mweb");
    }

    #[test]
    fn test_role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
