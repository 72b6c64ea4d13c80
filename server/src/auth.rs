//! Authentication for WebSocket clients and sensor producers.
//!
//! # Overview
//!
//! Clients authenticate the WebSocket handshake with a bearer token issued by
//! the identity provider. The token is carried either as a `token` query
//! parameter or in an `Authorization: Bearer <token>` header, and is resolved
//! to a stable user id through a [`TokenVerifier`].
//!
//! The verifier is a capability trait so the realtime core has no compile-time
//! dependency on a particular identity provider:
//!
//! - [`IdentityClient`](crate::identity::IdentityClient) - verifies tokens
//!   against the identity provider over HTTP
//! - [`InsecureTokenVerifier`] - development mode, accepts any non-empty token
//!   as the user id
//!
//! Sensor producers authenticate ingest requests with a shared secret checked
//! by [`validate_token`] in constant time.
//!
//! # Example
//!
//! ```rust
//! use axum::http::HeaderMap;
//! use sensorhub_server::auth::{extract_token, InsecureTokenVerifier, TokenVerifier};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let headers = HeaderMap::new();
//! let token = extract_token(Some("user-7"), &headers).expect("token present");
//!
//! let identity = InsecureTokenVerifier.verify(&token).await.unwrap();
//! assert_eq!(identity.uid, "user-7");
//! # }
//! ```

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Prefix of a bearer `Authorization` header value.
const BEARER_PREFIX: &str = "Bearer ";

/// Close reason sent when the handshake carried no token.
pub const REASON_UNAUTHORIZED: &str = "Unauthorized";

/// Close reason sent when the verifier rejected the token.
pub const REASON_VERIFICATION_FAILED: &str = "Token verification failed";

/// Errors that end an authentication attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied in the query string or `Authorization` header.
    #[error("missing bearer token")]
    MissingToken,

    /// The verifier rejected the token (invalid, expired or revoked).
    #[error("token rejected")]
    Rejected,

    /// The verifier could not be reached or answered unexpectedly.
    #[error("token verifier unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// The WebSocket close reason to report for this failure.
    ///
    /// ```rust
    /// use sensorhub_server::auth::AuthError;
    ///
    /// assert_eq!(AuthError::MissingToken.close_reason(), "Unauthorized");
    /// assert_eq!(AuthError::Rejected.close_reason(), "Token verification failed");
    /// ```
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::MissingToken => REASON_UNAUTHORIZED,
            Self::Rejected | Self::Unavailable(_) => REASON_VERIFICATION_FAILED,
        }
    }
}

/// An authenticated identity returned by a [`TokenVerifier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier.
    pub uid: String,

    /// The user's email address, if the provider returned one.
    #[serde(default)]
    pub email: Option<String>,

    /// Remaining claims returned by the provider.
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl Identity {
    /// Creates an identity with no email and no extra claims.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            claims: Map::new(),
        }
    }
}

/// Capability that maps an opaque bearer token to an [`Identity`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies `token` and returns the identity it belongs to.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Development verifier that trusts the token as the user id.
///
/// Only used when `SENSORHUB_UNSAFE_NO_AUTH=true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureTokenVerifier;

#[async_trait]
impl TokenVerifier for InsecureTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let uid = token.trim();
        if uid.is_empty() {
            return Err(AuthError::Rejected);
        }
        Ok(Identity::new(uid))
    }
}

/// Extracts the bearer token from the handshake.
///
/// The `token` query parameter wins over the `Authorization` header. Empty
/// values are treated as absent.
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    bearer_token(headers)
}

/// Returns the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Compares a provided shared secret against the expected one in constant time.
///
/// # Errors
///
/// Returns [`AuthError::Rejected`] if the tokens differ.
pub fn validate_token(provided: &str, expected: &str) -> Result<(), AuthError> {
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::Rejected)
    }
}
