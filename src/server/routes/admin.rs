//! Admin operations: settings, usage snapshots, cache clearing.
//!
//! All routes sit behind the constant-time bearer middleware and are
//! excluded from the global rate-limit window.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::context::ServiceContext;

/// `GET /admin/settings`: the current abuse-prevention settings blob.
pub async fn get_settings(State(ctx): State<Arc<ServiceContext>>) -> Json<Value> {
    Json(ctx.settings.blob().await)
}

/// `PUT /admin/settings`: replace the blob and invalidate the local cache.
pub async fn put_settings(
    State(ctx): State<Arc<ServiceContext>>,
    Json(blob): Json<Value>,
) -> Response {
    if !blob.is_object() {
        return crate::server::validation_error("Settings must be a JSON object.");
    }
    match ctx.settings.write(&blob).await {
        Ok(()) => {
            info!("abuse-prevention settings updated by admin");
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(e) => {
            tracing::error!("settings write failed: {e}");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "Could not persist settings.",
                })),
            )
                .into_response()
        }
    }
}

/// `GET /admin/usage`: spend ledger snapshot.
pub async fn get_usage(State(ctx): State<Arc<ServiceContext>>) -> Json<Value> {
    let usage = ctx.ledger.get_current_usage().await;
    Json(serde_json::to_value(usage).unwrap_or_else(|_| json!({})))
}

/// `POST /admin/cache/clear`: drop every answer cache tier and the parent
/// map (the next query reloads it).
pub async fn clear_cache(State(ctx): State<Arc<ServiceContext>>) -> Json<Value> {
    ctx.pipeline.exact_cache.clear();
    ctx.pipeline.semantic_cache.clear().await;
    ctx.pipeline.faq_cache.clear().await;
    ctx.pipeline.parents.invalidate().await;
    info!("answer caches cleared by admin");
    Json(json!({
        "status": "ok",
        "cleared": ["exact", "semantic", "faq", "parents"],
    }))
}
