//! Router assembly and server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method};
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::context::ServiceContext;
use crate::error::{HubError, Result};

use super::{middleware, routes};

/// Build the axum router with the full HTTP surface.
pub fn build_router(ctx: Arc<ServiceContext>) -> Router {
    let cors = match &ctx.config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(
                origin.parse().expect("valid CORS origin"),
            ))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
                HeaderName::from_static("x-fingerprint"),
            ]),
        // No configured origin (development): reflect anything.
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let admin = Router::new()
        .route(
            "/admin/settings",
            get(routes::admin::get_settings).put(routes::admin::put_settings),
        )
        .route("/admin/usage", get(routes::admin::get_usage))
        .route("/admin/cache/clear", post(routes::admin::clear_cache))
        .layer(axum_mw::from_fn_with_state(
            ctx.clone(),
            middleware::admin_auth_middleware,
        ));

    Router::new()
        .route("/chat/stream", post(routes::chat::chat_stream))
        .route("/auth/challenge", get(routes::challenge::issue_challenge))
        .route("/health", get(routes::health::get_health))
        .route("/health/live", get(routes::health::get_liveness))
        .route("/health/ready", get(routes::health::get_readiness))
        .route("/metrics", get(routes::metrics::get_metrics))
        .merge(admin)
        // Reject oversized payloads before any parsing or admission work.
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(axum_mw::from_fn_with_state(
            ctx.clone(),
            middleware::security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind and serve until the process is stopped.
pub async fn start_server(ctx: Arc<ServiceContext>) -> Result<()> {
    let addr = ctx.config.bind_address.clone();
    let app = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| HubError::Config(format!("could not bind {addr}: {e}")))?;
    info!("kbhub listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| HubError::Config(format!("server error: {e}")))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    async fn test_ctx() -> Arc<ServiceContext> {
        ServiceContext::initialize(Config::default()).await.unwrap()
    }

    async fn ctx_with_admin_token() -> Arc<ServiceContext> {
        let mut config = Config::default();
        config.admin_token = Some("test-admin-token".into());
        ServiceContext::initialize(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_security_headers_on_every_response() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(
            headers.get("x-content-type-options").and_then(|v| v.to_str().ok()),
            Some("nosniff")
        );
        assert_eq!(
            headers.get("x-frame-options").and_then(|v| v.to_str().ok()),
            Some("DENY")
        );
        assert_eq!(
            headers.get("referrer-policy").and_then(|v| v.to_str().ok()),
            Some("strict-origin-when-cross-origin")
        );
        assert!(headers.contains_key("permissions-policy"));
        let csp = headers
            .get("content-security-policy")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(csp.contains("frame-ancestors 'none'"));
        // Development mode: no HSTS on plain-HTTP localhost.
        assert!(!headers.contains_key("strict-transport-security"));
    }

    #[tokio::test]
    async fn test_hsts_only_in_production() {
        let mut config = Config::default();
        config.is_development = false;
        let ctx = ServiceContext::initialize(config).await.unwrap();
        let app = build_router(ctx);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get("strict-transport-security")
                .and_then(|v| v.to_str().ok()),
            Some("max-age=31536000; includeSubDomains")
        );
    }

    #[tokio::test]
    async fn test_security_headers_on_error_responses_too() {
        // Even a 401 from the admin layer carries the hardening set.
        let app = build_router(ctx_with_admin_token().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/usage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-content-type-options"));
    }

    #[tokio::test]
    async fn test_metrics_is_public() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_requires_bearer() {
        let app = build_router(ctx_with_admin_token().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/usage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_accepts_valid_bearer() {
        let app = build_router(ctx_with_admin_token().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/usage")
                    .header("authorization", "Bearer test-admin-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_rejects_wrong_bearer() {
        let app = build_router(ctx_with_admin_token().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/usage")
                    .header("authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_configured_token() {
        // No ADMIN_TOKEN: locked shut, not open.
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/usage")
                    .header("authorization", "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_chat_stream_empty_query_is_422() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/stream")
                    .header("content-type", "application/json")
                    .header("cf-connecting-ip", "203.0.113.5")
                    .body(Body::from(r#"{"query": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_chat_stream_oversize_query_is_422() {
        let app = build_router(test_ctx().await);
        let long = "x".repeat(500);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/stream")
                    .header("content-type", "application/json")
                    .header("cf-connecting-ip", "203.0.113.5")
                    .body(Body::from(format!(r#"{{"query": "{long}"}}"#)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_chat_stream_returns_sse() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/stream")
                    .header("content-type", "application/json")
                    .header("cf-connecting-ip", "203.0.113.5")
                    .body(Body::from(r#"{"query": "hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));
        // The greeting short-circuit means the stream completes quickly.
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains(r#""status":"thinking""#));
        assert!(body.contains(r#""status":"streaming""#));
        assert!(body.contains(r#""fromCache":"intent_greeting""#));
    }

    #[tokio::test]
    async fn test_challenge_endpoint_public() {
        let app = build_router(test_ctx().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/auth/challenge")
                    .header("cf-connecting-ip", "203.0.113.6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_per_identifier_limit_emits_429_with_retry_after() {
        let ctx = test_ctx().await;
        ctx.settings
            .write(&serde_json::json!({"chat_requests_per_minute": 1}))
            .await
            .unwrap();
        let app = build_router(ctx);

        let make_request = |fp: &str| {
            Request::builder()
                .method("POST")
                .uri("/chat/stream")
                .header("content-type", "application/json")
                .header("cf-connecting-ip", "203.0.113.7")
                .header("x-fingerprint", fp)
                .body(Body::from(r#"{"query": "hello"}"#))
                .unwrap()
        };

        let first = app.clone().oneshot(make_request("fp::stable77")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(make_request("fp:other:stable77")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
        let bytes = to_bytes(second.into_body(), 1 << 20).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "rate_limited");
        assert!(body["retry_after_seconds"].as_i64().unwrap() > 0);
    }
}
