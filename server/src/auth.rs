use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use constant_time_eq::constant_time_eq;

use crate::AppState;

pub const WORKER_SECRET_HEADER: &str = "x-worker-secret";
const USER_HEADER: &str = "x-user-id";

/// Identity verification is an upstream concern; by the time a request
/// reaches this service the gateway has stamped the caller's id. Absent
/// header means local/anonymous use.
pub fn user_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Mutual-auth middleware for worker-facing routes: a shared secret
/// compared in constant time. With no secret configured (single-binary
/// local mode) the routes are open.
pub async fn require_worker_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = state.worker_shared_secret.as_deref() {
        let presented = request
            .headers()
            .get(WORKER_SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(request).await)
}
