use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::cancellation::TokenError;
use crate::services::dispatcher::TriggerError;
use crate::services::job_store::StoreError;

/// Error returned by route handlers, rendered as `{"error": message}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing required data: {0}")]
    Validation(String),

    #[error("tenant not found: {0}")]
    NotFound(String),

    #[error("a job is already running for {0}")]
    Conflict(String),

    #[error("{0}")]
    Server(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TriggerError> for AppError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Validation(msg) => AppError::Validation(msg),
            TriggerError::TenantNotFound(db_name) => AppError::NotFound(db_name),
            TriggerError::AlreadyRunning(db_name) => AppError::Conflict(db_name),
            other => AppError::Server(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Server(err.to_string())
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        AppError::Server(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
