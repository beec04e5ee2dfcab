use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use podsim_core::CoreError;
use serde_json::json;
use tracing::error;
use tracing::info;

/// HTTP projection of the core failure taxonomy. Transition rejections are
/// NOT errors here: handlers turn them into `{updated: false}` bodies with
/// status 200 before this type is ever involved.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(CoreError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CoreError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            CoreError::AlreadyTerminal(_) => (StatusCode::CONFLICT, "terminal_state"),
            CoreError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            CoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            CoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            CoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!("request failed: {:#}", self.0);
        } else {
            info!("request rejected ({kind}): {}", self.0);
        }
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
