//! Native Gemini client: non-streaming completion, structured routing,
//! and SSE streaming generation.
//!
//! Thinking-model support: Gemini 2.5 models return parts tagged
//! `thought: true`. Those are intermediate reasoning steps and are filtered
//! out of both completion and streaming output.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{HubError, Result};

use super::{
    GenerationRequest, GenerationStream, LlmClient, QueryRouting, Role, StreamDelta, TokenUsage,
};

/// Gemini v1beta REST API base.
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Native Gemini client authenticated with an API key.
pub struct GeminiClient {
    api_key: String,
    model: String,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build HTTP client"),
            api_base: GEMINI_API_BASE.to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/models/{}:{endpoint}", self.api_base, self.model)
    }

    /// Build a `generateContent` body from system/context/history/user parts.
    fn build_body(request: &GenerationRequest) -> Value {
        let mut contents: Vec<Value> = Vec::with_capacity(request.history.len() + 1);
        for message in &request.history {
            let role = match message.role {
                Role::Assistant => "model",
                Role::User => "user",
            };
            contents.push(json!({
                "role": role,
                "parts": [{ "text": &message.content }]
            }));
        }
        contents.push(json!({
            "role": "user",
            "parts": [{ "text": &request.user }]
        }));

        let system = if request.context.is_empty() {
            request.system.clone()
        } else {
            format!("{}\n\nContext:\n{}", request.system, request.context)
        };

        json!({
            "contents": contents,
            "systemInstruction": { "parts": [{ "text": system }] },
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens
            }
        })
    }

    /// Extract answer text from a response, skipping `thought: true` parts.
    ///
    /// If only thought parts exist (unusual) they are returned so the caller
    /// always gets *something*.
    pub fn extract_text(response: &Value) -> Option<String> {
        let parts = response["candidates"][0]["content"]["parts"].as_array()?;

        let final_parts: Vec<&str> = parts
            .iter()
            .filter(|p| !p["thought"].as_bool().unwrap_or(false))
            .filter_map(|p| p["text"].as_str())
            .collect();
        if !final_parts.is_empty() {
            return Some(final_parts.join(""));
        }

        let thought_parts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
        if thought_parts.is_empty() {
            None
        } else {
            Some(thought_parts.join(""))
        }
    }

    /// Parse token usage from `usageMetadata` when present.
    fn extract_usage(response: &Value) -> Option<TokenUsage> {
        let meta = response.get("usageMetadata")?;
        Some(TokenUsage {
            input_tokens: meta["promptTokenCount"].as_u64()?,
            output_tokens: meta["candidatesTokenCount"].as_u64()?,
        })
    }

    /// Map a non-2xx response to a provider error with the API's message.
    fn api_error(status: u16, body: &str) -> HubError {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(String::from))
            .unwrap_or_else(|| body.chars().take(200).collect());
        HubError::Llm(format!("Gemini API error ({status}): {message}"))
    }

    async fn generate_once(&self, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.url("generateContent"))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::Llm(format!("Gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| HubError::Llm(format!("Failed to parse Gemini response: {e}")))
    }
}

/// Pull every SSE `data:` payload out of a buffer, returning leftover bytes.
///
/// Gemini's `alt=sse` stream is one JSON object per `data:` line, separated
/// by blank lines; chunks may split lines arbitrarily.
fn drain_sse_lines(buffer: &mut String) -> Vec<Value> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(value) => payloads.push(value),
                Err(e) => warn!("skipping unparseable SSE line: {e}"),
            }
        }
    }
    payloads
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "systemInstruction": { "parts": [{ "text": system }] },
            "generationConfig": { "temperature": 0.2, "maxOutputTokens": 256 }
        });
        let response = self.generate_once(body).await?;
        Self::extract_text(&response)
            .ok_or_else(|| HubError::Llm("empty completion response".to_string()))
    }

    async fn route_query(&self, system: &str, user: &str) -> Result<QueryRouting> {
        // Structured output keeps the router reliable at low temperature.
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "systemInstruction": { "parts": [{ "text": system }] },
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": 512,
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "object",
                    "properties": {
                        "is_dependent": { "type": "boolean" },
                        "standalone_query": { "type": "string" }
                    },
                    "required": ["is_dependent", "standalone_query"]
                }
            }
        });
        let response = self.generate_once(body).await?;
        let text = Self::extract_text(&response)
            .ok_or_else(|| HubError::Llm("empty router response".to_string()))?;
        serde_json::from_str::<QueryRouting>(&text)
            .map_err(|e| HubError::Llm(format!("router returned invalid JSON: {e}")))
    }

    async fn stream_generate(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let body = Self::build_body(&request);
        debug!(model = %self.model, "streaming generation request");

        let response = self
            .client
            .post(self.url("streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::Llm(format!("Gemini stream request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, &text));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamDelta>>(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage = None;
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(HubError::Llm(format!("stream read failed: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                for payload in drain_sse_lines(&mut buffer) {
                    if let Some(u) = GeminiClient::extract_usage(&payload) {
                        usage = Some(u);
                    }
                    if let Some(text) = GeminiClient::extract_text(&payload) {
                        if !text.is_empty()
                            && tx.send(Ok(StreamDelta::Chunk(text))).await.is_err()
                        {
                            // Receiver hung up (client disconnect); stop.
                            return;
                        }
                    }
                }
            }
            if let Some(u) = usage {
                let _ = tx.send(Ok(StreamDelta::Usage(u))).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::ChatMessage;
    use super::*;

    #[test]
    fn test_extract_text_skips_thought_parts() {
        let response = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "thinking...", "thought": true },
                        { "text": "Final answer" }
                    ]
                }
            }]
        });
        assert_eq!(
            GeminiClient::extract_text(&response).as_deref(),
            Some("Final answer")
        );
    }

    #[test]
    fn test_extract_text_falls_back_to_thoughts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "only thoughts", "thought": true }] }
            }]
        });
        assert_eq!(
            GeminiClient::extract_text(&response).as_deref(),
            Some("only thoughts")
        );
    }

    #[test]
    fn test_extract_text_joins_multiple_parts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "a " }, { "text": "b" }] }
            }]
        });
        assert_eq!(GeminiClient::extract_text(&response).as_deref(), Some("a b"));
    }

    #[test]
    fn test_extract_usage() {
        let response = json!({
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5 }
        });
        assert_eq!(
            GeminiClient::extract_usage(&response),
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5
            })
        );
        assert_eq!(GeminiClient::extract_usage(&json!({})), None);
    }

    #[test]
    fn test_build_body_maps_roles_and_lifts_system() {
        let request = GenerationRequest {
            system: "Be factual".into(),
            context: "MWEB launched in 2022.".into(),
            history: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            user: "what is mweb".into(),
            max_output_tokens: 2048,
            temperature: 0.3,
        };
        let body = GeminiClient::build_body(&request);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "what is mweb");
        let system = body["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(system.starts_with("Be factual"));
        assert!(system.contains("Context:\nMWEB launched in 2022."));
    }

    #[test]
    fn test_api_error_extracts_message() {
        let err = GeminiClient::api_error(429, r#"{"error": {"message": "quota exhausted"}}"#);
        assert!(err.to_string().contains("quota exhausted"));
        assert!(err.to_string().contains("429"));
    }

    #[test]
    fn test_drain_sse_lines_handles_split_chunks() {
        let mut buffer = String::from("data: {\"a\": 1}\n\ndata: {\"b\"");
        let first = drain_sse_lines(&mut buffer);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0]["a"], 1);
        // The partial line stays buffered until its newline arrives.
        buffer.push_str(": 2}\n");
        let second = drain_sse_lines(&mut buffer);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["b"], 2);
    }

    #[test]
    fn test_drain_sse_lines_skips_done_and_garbage() {
        let mut buffer = String::from("data: [DONE]\ndata: not-json\n: comment\n\n");
        assert!(drain_sse_lines(&mut buffer).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_url_includes_model_and_endpoint() {
        let client = GeminiClient::new("key", "gemini-2.0-flash-lite");
        let url = client.url("streamGenerateContent");
        assert!(url.contains("gemini-2.0-flash-lite"));
        assert!(url.ends_with(":streamGenerateContent"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let client = GeminiClient::new("super-secret", "m");
        let debug = format!("{client:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
