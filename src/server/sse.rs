//! SSE event envelope.
//!
//! One JSON object per `data:` line, five shapes total. Everything a client
//! sees (cached answers, generated answers, fallbacks, errors) arrives in
//! exactly this envelope.

use axum::response::sse::Event;
use serde_json::{json, Value};

use crate::retrieval::Document;

fn event(value: Value) -> Event {
    Event::default().data(value.to_string())
}

/// Initial `{status: "thinking"}` payload.
pub fn thinking_value() -> Value {
    json!({
        "status": "thinking",
        "chunk": "",
        "isComplete": false,
    })
}

/// One-time `{status: "sources"}` payload (published sources only; callers
/// must filter before handing documents in).
pub fn sources_value(documents: &[Document]) -> Value {
    json!({
        "status": "sources",
        "sources": documents,
        "isComplete": false,
    })
}

/// Incremental `{status: "streaming"}` payload.
pub fn streaming_value(chunk: &str) -> Value {
    json!({
        "status": "streaming",
        "chunk": chunk,
        "isComplete": false,
    })
}

/// Terminal `{status: "complete"}` payload. `fromCache` is the serving tier
/// name, or boolean `false` for generated answers.
pub fn complete_value(from_cache: Option<&str>) -> Value {
    let from_cache_value = match from_cache {
        Some(tier) => json!(tier),
        None => json!(false),
    };
    json!({
        "status": "complete",
        "chunk": "",
        "isComplete": true,
        "fromCache": from_cache_value,
    })
}

/// Terminal `{status: "error"}` payload with a sanitized message.
pub fn error_value(message: &str) -> Value {
    json!({
        "status": "error",
        "error": message,
        "isComplete": true,
    })
}

pub fn thinking() -> Event {
    event(thinking_value())
}

pub fn sources(documents: &[Document]) -> Event {
    event(sources_value(documents))
}

pub fn streaming(chunk: &str) -> Event {
    event(streaming_value(chunk))
}

pub fn complete(from_cache: Option<&str>) -> Event {
    event(complete_value(from_cache))
}

pub fn error(message: &str) -> Event {
    event(error_value(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_shape() {
        let value = thinking_value();
        assert_eq!(value["status"], "thinking");
        assert_eq!(value["isComplete"], false);
    }

    #[test]
    fn test_sources_shape() {
        let docs = vec![Document::published("content", "c1")];
        let value = sources_value(&docs);
        assert_eq!(value["status"], "sources");
        assert_eq!(value["sources"][0]["page_content"], "content");
        assert_eq!(value["sources"][0]["metadata"]["chunk_id"], "c1");
    }

    #[test]
    fn test_complete_from_cache_variants() {
        let generated = complete_value(None);
        assert_eq!(generated["fromCache"], false);
        let cached = complete_value(Some("exact"));
        assert_eq!(cached["fromCache"], "exact");
        assert_eq!(cached["isComplete"], true);
    }

    #[test]
    fn test_error_shape() {
        let value = error_value("sanitized message");
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "sanitized message");
        assert_eq!(value["isComplete"], true);
    }

    #[test]
    fn test_streaming_preserves_chunk_text() {
        assert_eq!(streaming_value("Lite")["chunk"], "Lite");
    }

    #[test]
    fn test_events_build_without_panicking() {
        let _ = thinking();
        let _ = sources(&[]);
        let _ = streaming("x");
        let _ = complete(Some("semantic"));
        let _ = error("e");
    }
}
