//! Error type shared by the pipeline and the route handlers

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A required request field was missing or empty
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Non-success or malformed response from the YouTube API
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Artifact or metadata store operation failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) | AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Validation(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::Upstream(_) | AppError::Storage(_) => {
                tracing::error!(error = %self, "request failed");
                "internal server error".to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Extension trait for attaching context to foreign errors at I/O seams
pub trait ResultExt<T> {
    fn upstream(self, context: &str) -> Result<T, AppError>;

    fn storage(self, context: &str) -> Result<T, AppError>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn upstream(self, context: &str) -> Result<T, AppError> {
        self.map_err(|e| AppError::Upstream(format!("{}: {}", context, e)))
    }

    fn storage(self, context: &str) -> Result<T, AppError> {
        self.map_err(|e| AppError::Storage(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Validation("missing".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("User not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Upstream("quota".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_context_is_prefixed() {
        let result: Result<(), &str> = Err("connection reset");
        let err = result.storage("write object").unwrap_err();
        assert_eq!(err.to_string(), "storage error: write object: connection reset");
    }
}
