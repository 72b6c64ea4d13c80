//! Error types for the SensorHub server.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration loading failures (missing variables, bad formats)
//! - [`ServerError`] - Top-level errors surfaced through the HTTP API
//!
//! Failures inside the realtime core are scoped to a single connection and
//! have their own module-level types: [`AuthError`](crate::auth::AuthError),
//! [`ProtocolError`](crate::protocol::ProtocolError) and
//! [`DeliveryError`](crate::registry::DeliveryError). Only `AuthError` crosses
//! the HTTP boundary; delivery failures are counted in a
//! [`DeliveryReport`](crate::dispatch::DeliveryReport) instead.
//!
//! # Example
//!
//! ```rust
//! use sensorhub_server::error::ServerError;
//!
//! fn check_payload(body: &serde_json::Value) -> Result<(), ServerError> {
//!     if !body.is_object() {
//!         return Err(ServerError::validation("payload must be a JSON object"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_payload(&serde_json::json!([1, 2])).is_err());
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::error;

use crate::auth::AuthError;

/// Errors that occur while loading configuration from the environment.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat {
        /// The offending variable.
        var: String,
        /// Why the value was rejected.
        message: String,
    },
}

impl ConfigError {
    /// Creates a new missing variable error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sensorhub_server::error::ConfigError;
    ///
    /// let err = ConfigError::missing("SENSORHUB_IDENTITY_URL");
    /// assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    /// ```
    pub fn missing(var: impl Into<String>) -> Self {
        Self::MissingEnvVar(var.into())
    }

    /// Creates a new invalid format error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sensorhub_server::error::ConfigError;
    ///
    /// let err = ConfigError::invalid("PORT", "must be a number between 1 and 65535");
    /// assert!(matches!(err, ConfigError::InvalidFormat { .. }));
    /// ```
    pub fn invalid(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// Top-level error type for the SensorHub server.
///
/// # Error Categories
///
/// - **Configuration errors**: problems loading server config
/// - **Authentication errors**: missing or rejected credentials
/// - **Validation errors**: malformed request data
/// - **Internal errors**: anything else
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// Authentication failure.
    Auth(AuthError),

    /// Request validation failure.
    Validation(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl ServerError {
    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sensorhub_server::error::ServerError;
    ///
    /// let err = ServerError::validation("payload must be a JSON object");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Validation(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Config(_))
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code included in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "server_error",
            Self::Auth(AuthError::MissingToken) => "missing_token",
            Self::Auth(AuthError::Rejected) => "invalid_token",
            Self::Auth(AuthError::Unavailable(_)) => "auth_unavailable",
            Self::Validation(_) => "invalid_format",
            Self::Internal(_) => "server_error",
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_server_error() {
            error!(error = %self, "Request failed with server error");
        }

        // Internal details stay in the logs.
        let message = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: message,
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
