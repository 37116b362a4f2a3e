use thiserror::Error;

/// Errors surfaced by the conversion engine to its callers.
///
/// Store implementations report failures through `anyhow`; the engine's retry
/// layer turns exhausted retries into [`ConversionError::StorageUnavailable`].
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("validation error on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("funnel not found: {0}")]
    FunnelNotFound(String),

    #[error("funnel is not active: {0}")]
    FunnelInactive(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("storage unavailable during {operation} after {attempts} attempts: {message}")]
    StorageUnavailable {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("analytics computation timed out after {0} ms")]
    AnalyticsTimeout(u64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConversionError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::InvalidEvent(message.into())
    }
}
