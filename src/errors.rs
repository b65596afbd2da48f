//! Application error model with HTTP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to an HTTP status and a JSON error body so that every
//! failure path still produces a well-formed response.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers validation, authentication, and pipeline infrastructure failures.
/// Each variant maps to an HTTP status code in [`AppError::status`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request or config)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Missing or incorrect shared secret
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Request body over the configured limit
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    /// Internal error (spawn failure, filesystem error, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Message without the variant prefix, as shown to API callers
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidInput(msg)
            | Self::Unauthorized(msg)
            | Self::PayloadTooLarge(msg)
            | Self::Internal(msg) => msg,
        }
    }

    /// HTTP status for this error
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → 400
    /// - `Unauthorized` → 401
    /// - `PayloadTooLarge` → 413
    /// - `Internal` → 500
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
