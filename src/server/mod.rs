//! HTTP surface: axum router, SSE encoding, admin auth, route handlers.

pub mod app;
pub mod middleware;
pub mod routes;
pub mod sse;

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::admission::AdmissionDenial;

pub use app::{build_router, start_server};

/// Transport-level client address, when the server was started with connect
/// info. Never fails extraction: handlers degrade to header-derived IPs in
/// tests and behind non-TCP transports.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
        ))
    }
}

impl IntoResponse for AdmissionDenial {
    fn into_response(self) -> Response {
        match self {
            AdmissionDenial::RateLimited(denial) => {
                let mut body = json!({
                    "error": denial.code,
                    "message": denial.message,
                    "retry_after_seconds": denial.retry_after,
                });
                if let Some((per_minute, per_hour)) = denial.limits {
                    body["limits"] = json!({
                        "per_minute": per_minute,
                        "per_hour": per_hour,
                    });
                }
                if let Some(expiry) = denial.ban_expires_at {
                    body["ban_expires_at"] = json!(expiry);
                }
                if let Some(count) = denial.violation_count {
                    body["violation_count"] = json!(count);
                }
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, denial.retry_after.to_string())],
                    Json(body),
                )
                    .into_response()
            }
            AdmissionDenial::ChallengeRejected { message } => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "invalid_challenge",
                    "message": message,
                })),
            )
                .into_response(),
            AdmissionDenial::CostThrottled {
                message,
                retry_after,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(json!({
                    "error": "cost_throttled",
                    "message": message,
                    "retry_after_seconds": retry_after,
                    "requires_verification": true,
                })),
            )
                .into_response(),
        }
    }
}

/// 422 with a generic sanitized body (no echo of the offending input).
pub fn validation_error(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "error": "validation_error",
            "message": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RateLimitDenial;

    #[test]
    fn test_rate_limit_response_shape() {
        let denial = AdmissionDenial::RateLimited(RateLimitDenial {
            code: "rate_limited",
            message: "Too many requests. You have been temporarily banned.".into(),
            limits: Some((10, 100)),
            retry_after: 60,
            ban_expires_at: Some(1_723_456_789),
            violation_count: Some(2),
        });
        let response = denial.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("60")
        );
    }

    #[test]
    fn test_challenge_rejection_is_403() {
        let denial = AdmissionDenial::ChallengeRejected {
            message: "mismatch".into(),
        };
        assert_eq!(denial.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_cost_throttle_is_429_with_retry_after() {
        let denial = AdmissionDenial::CostThrottled {
            message: "High usage detected.".into(),
            retry_after: 30,
        };
        let response = denial.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
