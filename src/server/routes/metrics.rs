//! Prometheus scrape endpoint.

use axum::http::header;
use axum::response::IntoResponse;

pub async fn get_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
