//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{ErrorClassification, ErrorKind};
use inventory::InventoryError;
use lock::LockError;
use storage::StorageError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// A dependency failed its readiness probe.
    #[error("{0}")]
    Unavailable(String),
}

impl ErrorClassification for ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::Validation,
            Self::Inventory(err) => err.kind(),
            Self::Unavailable(_) => ErrorKind::Transport,
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InsufficientStock | ErrorKind::FailedPrecondition | ErrorKind::AlreadyExists => {
            StatusCode::CONFLICT
        }
        ErrorKind::Concurrency => StatusCode::LOCKED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, ?kind, "request failed");
        } else {
            tracing::debug!(error = %message, ?kind, "request rejected");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Unavailable(format!("storage: {err}"))
    }
}

impl From<LockError> for ApiError {
    fn from(err: LockError) -> Self {
        ApiError::Unavailable(format!("lock: {err}"))
    }
}
