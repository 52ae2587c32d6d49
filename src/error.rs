//! # Error Handling
//!
//! This module defines the error taxonomy shared by the REST handlers and the
//! experiment WebSocket protocol.
//!
//! ## Error Categories:
//! - **Validation**: the client sent something malformed (bad JSON, missing fields,
//!   out-of-range step, non-positive frequency, unknown message type). Reported back,
//!   no state changes.
//! - **Processing**: a stage could not be processed (undecodable audio, unsupported
//!   format). The stage keeps its last committed status; other stages are unaffected.
//! - **NotFound**: session or result record does not exist. At connection start this
//!   is fatal and the WebSocket upgrade is refused.
//! - **Internal / ConfigError**: server-side problems.
//!
//! Numerically invalid measurements (too few minima, implausible γ) are NOT errors.
//! They travel as `Measurement::Invalid` values, see `experiment::model`.
//!
//! ## Rust Concepts:
//! - **enum**: each variant is one category of failure
//! - **From trait**: lets `?` convert library errors into `AppError`
//! - **ResponseError trait**: turns an `AppError` into an HTTP response

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::ValidationError("Frequency must be positive".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors (lock poisoning, worker pool failures, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested session or result was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Audio for a stage could not be decoded or processed
    Processing(String),
}

impl AppError {
    /// Machine-readable code used in WebSocket `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Processing(_) => "processing_error",
        }
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Processing(msg) => msg,
        }
    }
}

/// Human-readable formatting, used in logs and in `error` frames.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Processing(msg) => write!(f, "Processing error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - Processing → 422 (Unprocessable Entity)
/// - NotFound → 404 (Not Found)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 6f1c... does not exist",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Processing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.code(),                 // Machine-readable error type
                "message": self.message(),           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Anything bubbling up through `anyhow` is a server-side problem.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to
/// BadRequest rather than Internal.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Configuration loading failures (bad `config.toml`, bad `APP__*` variables).
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::ValidationError("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Processing("x".into()).status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(AppError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_codes_and_messages() {
        let err = AppError::Processing("Unsupported audio format: webm".into());
        assert_eq!(err.code(), "processing_error");
        assert_eq!(err.message(), "Unsupported audio format: webm");
        assert_eq!(err.to_string(), "Processing error: Unsupported audio format: webm");
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AppError = parse_err.into();
        assert_eq!(err.code(), "bad_request");
    }
}
