use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use convertly_core::ConversionError;

/// Application-level errors that map directly to HTTP responses.
///
/// Handlers return `Result<impl IntoResponse, AppError>`; engine errors
/// convert through `From<ConversionError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<ConversionError> for AppError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::Validation { field, message } => AppError::Validation { field, message },
            ConversionError::FunnelNotFound(id) => AppError::NotFound(format!("funnel {id} not found")),
            ConversionError::SessionNotFound(id) => AppError::NotFound(format!("session {id} not found")),
            ConversionError::InvalidEvent(message) => AppError::InvalidEvent(message),
            ConversionError::FunnelInactive(id) => {
                AppError::Conflict(format!("funnel {id} is not accepting events"))
            }
            err @ (ConversionError::StorageUnavailable { .. } | ConversionError::AnalyticsTimeout(_)) => {
                AppError::Unavailable(err.to_string())
            }
            ConversionError::Serialization(e) => AppError::Internal(e.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, field) = match &self {
            AppError::Validation { field, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                message.as_str(),
                Some(field.as_str()),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str(), None),
            AppError::InvalidEvent(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_event", msg.as_str(), None)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "funnel_inactive", msg.as_str(), None),
            AppError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {msg}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "Storage temporarily unavailable, retry later",
                    None,
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                    None,
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": field
                }
            })),
        )
            .into_response()
    }
}
