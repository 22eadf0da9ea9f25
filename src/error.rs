//! Error types shared across the crate.
//!
//! Internal modules propagate `HubError`; the HTTP boundary is the single
//! sanitization point and never forwards these messages to clients verbatim.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HubError>;

/// Top-level error type for the service.
#[derive(Debug, Error)]
pub enum HubError {
    /// Configuration is missing or malformed at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// KV store (Redis or in-memory backend) failure.
    #[error("KV store error: {0}")]
    Kv(String),

    /// LLM provider failure (request, response parsing, or API error body).
    #[error("LLM provider error: {0}")]
    Llm(String),

    /// Embeddings service failure.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Retrieval backend failure (vector index or sparse retriever).
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Input failed validation (oversize query, malformed body).
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound HTTP failure (LLM, embeddings, Turnstile, webhooks).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<redis::RedisError> for HubError {
    fn from(e: redis::RedisError) -> Self {
        HubError::Kv(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = HubError::Kv("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.to_string().starts_with("KV store error"));
    }

    #[test]
    fn test_serde_error_converts() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: HubError = bad.unwrap_err().into();
        assert!(matches!(err, HubError::Serialization(_)));
    }
}
