use crate::services::storage_service::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// Error returned by handlers. Carries the HTTP status, the stable wire code
/// and a human-readable message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// 400 with the given wire code.
    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_not_available",
            msg,
        )
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "object_not_found", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error_code": self.code,
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let code = err.code();
        match err {
            StorageError::BadDirName(_) | StorageError::BadFile | StorageError::BadFormData(_) => {
                Self::bad_request(code, err.to_string())
            }
            StorageError::NotFound => Self::not_found(err.to_string()),
            StorageError::ServiceUnavailable => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, err.to_string())
            }
            StorageError::Io { .. } | StorageError::Transform(_) | StorageError::Archive(_) => {
                error!(%err, "storage operation failed");
                Self::internal(err.to_string())
            }
        }
    }
}
