//! # Error Handling
//!
//! This module defines the error type shared by the capture pipeline, the playback
//! sequencer and the relay, plus how it is rendered as an HTTP response.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Pattern matching**: Use `match` to handle different error types
//!
//! ## Error Propagation Policy:
//! - **Capture / playback errors** are returned synchronously to the caller
//! - **Relay errors** stay inside the session that produced them and are only logged
//! - **Nothing retries automatically**; retry policy belongs to the caller

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **CaptureDevice**: Microphone/device unavailable or permission denied
/// - **Playback**: The playback device refused a segment
/// - **UpstreamConnect**: The realtime service channel could not be established
/// - **UpstreamRuntime**: An established realtime service channel failed
///
/// ## Usage Example:
/// ```rust
/// use voice_relay_backend::error::AppError;
/// let err = AppError::UpstreamConnect("connection refused".to_string());
/// assert!(err.to_string().contains("connection refused"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Capture device could not be opened at recording start
    CaptureDevice(String),

    /// Playback device rejected a segment
    Playback(String),

    /// Upstream channel failed to establish
    UpstreamConnect(String),

    /// Upstream channel reported an error after the session became active
    UpstreamRuntime(String),
}

impl AppError {
    /// Machine-readable error kind, used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
            AppError::CaptureDevice(_) => "capture_device_error",
            AppError::Playback(_) => "playback_error",
            AppError::UpstreamConnect(_) => "upstream_connect_error",
            AppError::UpstreamRuntime(_) => "upstream_runtime_error",
        }
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Rust Concepts:
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings (like printf in C)
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::CaptureDevice(msg) => write!(f, "Capture device error: {}", msg),
            AppError::Playback(msg) => write!(f, "Playback error: {}", msg),
            AppError::UpstreamConnect(msg) => write!(f, "Upstream connect error: {}", msg),
            AppError::UpstreamRuntime(msg) => write!(f, "Upstream runtime error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest → 400 (Bad Request)
/// - UpstreamConnect / UpstreamRuntime → 502 (Bad Gateway)
/// - CaptureDevice / Playback → 409 (Conflict, the device state is the problem)
/// - Everything else → 500 (Internal Server Error)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "upstream_connect_error",
///     "message": "connection refused",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamConnect(_) | AppError::UpstreamRuntime(_) => StatusCode::BAD_GATEWAY,
            AppError::CaptureDevice(_) | AppError::Playback(_) => StatusCode::CONFLICT,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg)
            | AppError::CaptureDevice(msg)
            | AppError::Playback(msg)
            | AppError::UpstreamConnect(msg)
            | AppError::UpstreamRuntime(msg) => msg.clone(),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),           // Machine-readable error type
                "message": message,            // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON errors only come from building the upstream configuration message,
/// which is server-side data, so they are internal errors.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Handshake failures and socket errors from the realtime service.
///
/// Callers that know the session is already active re-map this to
/// `UpstreamRuntime`; by default a tungstenite error means the connect failed.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::UpstreamConnect(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Rust Concepts:
/// - **type alias**: Creates a new name for an existing type
/// - **Generic type**: `T` can be any type (String, AppConfig, etc.)
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::UpstreamConnect("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::CaptureDevice("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::ConfigError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display_includes_message() {
        let err = AppError::UpstreamRuntime("socket reset".to_string());
        assert_eq!(err.to_string(), "Upstream runtime error: socket reset");
        assert_eq!(err.kind(), "upstream_runtime_error");
    }
}
