//! Challenge issuance endpoint.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::admission::identity;
use crate::context::ServiceContext;
use crate::server::ClientAddr;

/// `GET /auth/challenge`.
///
/// Challenges are bound to the caller's IP: at issuance time the challenge
/// is not yet part of any fingerprint, and consumption (in the admission
/// gate) verifies against the same IP.
pub async fn issue_challenge(
    State(ctx): State<Arc<ServiceContext>>,
    ClientAddr(remote): ClientAddr,
    headers: HeaderMap,
) -> Response {
    let ip = identity::extract_ip(&headers, remote, ctx.config.trust_x_forwarded_for);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    match ctx.challenges.issue(&ip, now).await {
        Ok(challenge) => Json(challenge).into_response(),
        Err(denial) => denial.into_response(),
    }
}
