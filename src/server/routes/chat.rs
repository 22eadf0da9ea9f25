//! Streaming chat endpoint.
//!
//! `POST /chat/stream`: admission gate, then the query pipeline, with every
//! terminal mapped onto the SSE envelope. Spend-limit rejections happen
//! before the stream starts and surface as a real 429.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::admission::{identity, AdmissionRequest};
use crate::context::ServiceContext;
use crate::pipeline::{PipelineEvent, QueryResponse};
use crate::server::{sse, ClientAddr};
use crate::spend::LimitKind;

/// One raw history turn as clients send it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Body of `POST /chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub chat_history: Vec<ChatTurn>,
    #[serde(default)]
    pub turnstile_token: Option<String>,
}

/// Collapse the raw turn list into `(human, ai)` pairs, skipping malformed
/// runs instead of rejecting the whole request.
fn pair_history(turns: &[ChatTurn]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i + 1 < turns.len() {
        if turns[i].role == "human" && turns[i + 1].role == "ai" {
            pairs.push((turns[i].content.clone(), turns[i + 1].content.clone()));
            i += 2;
        } else {
            warn!(index = i, "skipping malformed chat history pair");
            i += 1;
        }
    }
    pairs
}

pub async fn chat_stream(
    State(ctx): State<Arc<ServiceContext>>,
    ClientAddr(remote): ClientAddr,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    // Validation: oversize or empty queries never reach the pipeline.
    if request.query.trim().is_empty() {
        return crate::server::validation_error("Query must not be empty.");
    }
    if request.query.chars().count() > ctx.config.max_query_length {
        return crate::server::validation_error("Query exceeds the maximum allowed length.");
    }

    let identity = identity::resolve(&headers, remote, ctx.config.trust_x_forwarded_for);

    let history_chars: usize = request.chat_history.iter().map(|t| t.content.len()).sum();
    let admission = AdmissionRequest {
        method: "POST",
        path: "/chat/stream",
        turnstile_token: request.turnstile_token.as_deref(),
        query_chars: request.query.len(),
        history_chars,
        is_query_endpoint: true,
    };
    if let Err(denial) = ctx.gate.admit(&identity, admission).await {
        return denial.into_response();
    }

    crate::metrics::QUERIES_TOTAL.inc();
    let request_id = uuid::Uuid::new_v4();
    let history = pair_history(&request.chat_history);

    let rx = match ctx
        .pipeline
        .clone()
        .stream_query(request.query.clone(), history)
        .await
    {
        QueryResponse::SpendLimited(kind) => {
            let type_name = match kind {
                LimitKind::Daily => "daily",
                LimitKind::Hourly => "hourly",
            };
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "spend_limit_exceeded",
                    "message": "We've reached our usage limit. Please try again later.",
                    "type": type_name,
                })),
            )
                .into_response();
        }
        QueryResponse::Stream(rx) => rx,
    };

    let events = futures::stream::once(async { Ok::<_, Infallible>(sse::thinking()) }).chain(
        ReceiverStream::new(rx).filter_map(move |event| async move {
            match event {
                PipelineEvent::Sources(docs) => Some(Ok(sse::sources(&docs))),
                PipelineEvent::Chunk(chunk) => Some(Ok(sse::streaming(&chunk))),
                PipelineEvent::Metadata(metadata) => {
                    // Consumed server-side: accounting log, never an SSE frame.
                    info!(
                        %request_id,
                        input_tokens = metadata.input_tokens,
                        output_tokens = metadata.output_tokens,
                        cost_usd = metadata.cost_usd,
                        cache_hit = metadata.cache_hit,
                        cache_type = metadata.cache_type.as_deref().unwrap_or("none"),
                        "query completed"
                    );
                    None
                }
                PipelineEvent::Complete { from_cache } => {
                    Some(Ok(sse::complete(from_cache.as_deref())))
                }
                PipelineEvent::Error { message } => Some(Ok(sse::error(&message))),
            }
        }),
    );

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ChatTurn {
        ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_pair_history_happy_path() {
        let turns = vec![turn("human", "q1"), turn("ai", "a1"), turn("human", "q2"), turn("ai", "a2")];
        assert_eq!(
            pair_history(&turns),
            vec![
                ("q1".to_string(), "a1".to_string()),
                ("q2".to_string(), "a2".to_string())
            ]
        );
    }

    #[test]
    fn test_pair_history_skips_malformed_runs() {
        // Leading ai turn desynchronizes; the pairer resyncs on the next
        // human/ai pair instead of failing.
        let turns = vec![turn("ai", "stray"), turn("human", "q1"), turn("ai", "a1")];
        assert_eq!(pair_history(&turns), vec![("q1".to_string(), "a1".to_string())]);
    }

    #[test]
    fn test_pair_history_drops_trailing_unpaired_turn() {
        let turns = vec![turn("human", "q1"), turn("ai", "a1"), turn("human", "dangling")];
        assert_eq!(pair_history(&turns).len(), 1);
    }

    #[test]
    fn test_chat_request_deserializes_minimal_body() {
        let request: ChatRequest = serde_json::from_str(r#"{"query": "what is mweb"}"#).unwrap();
        assert_eq!(request.query, "what is mweb");
        assert!(request.chat_history.is_empty());
        assert!(request.turnstile_token.is_none());
    }
}
