use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use deaddrop_shared::types::UploadId;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid code")]
    InvalidCode,

    #[error("Session is full")]
    SessionFull,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Sender is not a connected member of this session")]
    NotConnected,

    #[error("Session limit reached ({active} active, max {max})")]
    SessionCapReached { active: usize, max: i64 },

    #[error("Pairing code space exhausted")]
    CodeSpaceExhausted,

    #[error("Storage quota exceeded")]
    QuotaExceeded { current: u64, limit: u64 },

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Upload not found: {0}")]
    UploadNotFound(UploadId),

    #[error("Chunk index {index} out of range (total {total})")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Upload incomplete: {received} of {total} chunks received")]
    UploadIncomplete { received: u32, total: u32 },

    #[error("Assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid path component: {0}")]
    InvalidPath(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServerError {
    /// Short reason string reported over the event channel. Validation
    /// failures there are `error` events, never disconnects, and clients
    /// match on these exact values.
    pub fn event_reason(&self) -> &'static str {
        match self {
            ServerError::InvalidCode | ServerError::SessionNotFound(_) => "InvalidCode",
            ServerError::SessionFull => "SessionFull",
            ServerError::NotConnected => "NotConnected",
            ServerError::BadRequest(_) => "BadRequest",
            _ => "InternalError",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Quota denials carry usage numbers so clients can render them.
        if let ServerError::QuotaExceeded { current, limit } = &self {
            let body = serde_json::json!({
                "error": "Storage quota exceeded",
                "currentUsage": current,
                "limit": limit,
            });
            return (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(body)).into_response();
        }

        let (status, message) = match &self {
            ServerError::InvalidCode | ServerError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::SessionFull => (StatusCode::CONFLICT, self.to_string()),
            ServerError::SessionNotFound(_)
            | ServerError::UploadNotFound(_)
            | ServerError::FileNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::NotConnected | ServerError::Forbidden(_) => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            ServerError::SessionCapReached { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            ServerError::CodeSpaceExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ServerError::QuotaExceeded { .. } | ServerError::FileTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::InvalidChunkIndex { .. } | ServerError::UploadIncomplete { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::InvalidPath(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::SizeMismatch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            ServerError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
