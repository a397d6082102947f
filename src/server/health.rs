//! Liveness endpoint.

use axum::http::StatusCode;

/// Answers `200 OK` with the body `OK` while the refinery process is up.
///
/// Says nothing about the queue itself; `/api/v1/anomalies` covers that.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
