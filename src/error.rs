//! Service error taxonomy.
//!
//! Request-path failures fall into a small closed set of categories, each
//! with a stable machine-readable code surfaced on error events and HTTP
//! responses. Component-level degradation (analyzer, few-shot, composer)
//! never reaches this type; it is absorbed with defaults and a debug note.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Errors that terminate a request (or a stream) with a typed surface.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed request or disallowed SQL.
    #[error("validation error: {0}")]
    Validation(String),

    /// LLM, embedder, or executor call failed after retry.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Unknown conversation or entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Tool denied by the permission manager.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Request budget exhausted.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Any other unexpected condition.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable machine-readable code for error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Upstream(_) => "upstream_error",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission_denied",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Permission(_) => StatusCode::FORBIDDEN,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// Convenience result alias for handler code.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ServiceError::Validation("x".into()).code(), "validation_error");
        assert_eq!(ServiceError::DeadlineExceeded.code(), "deadline_exceeded");
        assert_eq!(ServiceError::NotFound("c1".into()).code(), "not_found");
    }
}
