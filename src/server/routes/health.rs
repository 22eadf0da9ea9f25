//! Liveness and readiness probes. Output is sanitized: component names and
//! states only, never connection details.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::context::ServiceContext;
use crate::health::ComponentHealth;

/// `GET /health`: overall service health from the component registry.
pub async fn get_health(State(ctx): State<Arc<ServiceContext>>) -> Json<serde_json::Value> {
    let mut body = ctx.health.snapshot();
    body["service"] = json!("kbhub");
    body["version"] = json!(env!("CARGO_PKG_VERSION"));
    Json(body)
}

/// `GET /health/live`: process is up.
pub async fn get_liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

/// `GET /health/ready`: dependencies answer; 503 otherwise.
pub async fn get_readiness(State(ctx): State<Arc<ServiceContext>>) -> impl IntoResponse {
    match ctx.kv.ping().await {
        Ok(()) => {
            ctx.health.set("kv", ComponentHealth::Up);
            (StatusCode::OK, Json(json!({ "status": "ready" })))
        }
        Err(_) => {
            ctx.health.set("kv", ComponentHealth::Down);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "component": "kv" })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_health_and_readiness_with_memory_kv() {
        let ctx = ServiceContext::initialize(Config::default()).await.unwrap();
        let Json(body) = get_health(State(ctx.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "kbhub");

        let response = get_readiness(State(ctx)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_liveness_is_static() {
        let Json(body) = get_liveness().await;
        assert_eq!(body["status"], "alive");
    }
}
