//! Request/response middleware: admin authentication and security headers.
//!
//! Admin auth: `Authorization: Bearer <token>` compared in constant time
//! against the configured admin token. No token configured means the admin
//! surface is disabled outright, never open.
//!
//! Security headers: a fixed hardening set on every response, with HSTS
//! only outside development (no TLS on localhost).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::context::ServiceContext;

/// Constant-time bearer-token comparison.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        // Length leaks through any comparison; equalize by failing here.
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Layer applied to every `/admin` route.
pub async fn admin_auth_middleware(
    State(ctx): State<Arc<ServiceContext>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = ctx.config.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        warn!("admin request rejected: ADMIN_TOKEN not configured");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token, expected) => Ok(next.run(request).await),
        _ => {
            warn!("admin request with missing or invalid bearer token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Relaxed CSP: same-origin resources, no framing, inline scripts/styles
/// allowed for the API docs UI.
const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; frame-ancestors 'none'; \
     script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'";

/// Layer applied to every response: standard hardening headers, plus HSTS
/// outside development.
pub async fn security_headers_middleware(
    State(ctx): State<Arc<ServiceContext>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    if !ctx.config.is_development {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches_exact() {
        assert!(token_matches("secret-token", "secret-token"));
    }

    #[test]
    fn test_token_rejects_wrong_value() {
        assert!(!token_matches("secret-tokex", "secret-token"));
        assert!(!token_matches("", "secret-token"));
        assert!(!token_matches("secret", "secret-token"));
    }

    #[test]
    fn test_token_rejects_prefix_match() {
        assert!(!token_matches("secret-token-extra", "secret-token"));
    }
}
