//! HTTP client for the identity provider.
//!
//! The provider exposes two things the server relies on:
//! - token verification via `GET /auth/v1/user`
//! - the user profile document store under `/rest/v1/users`
//!
//! [`IdentityClient`] implements both [`TokenVerifier`] and [`ProfileStore`],
//! so the rest of the server only ever sees those capability traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sensorhub_server::auth::TokenVerifier;
//! use sensorhub_server::identity::IdentityClient;
//!
//! let client = Arc::new(IdentityClient::new(
//!     "https://identity.example.com",
//!     "public-api-key",
//! )?);
//!
//! let identity = client.verify("user-bearer-token").await?;
//! println!("User ID: {}", identity.uid);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::profile::{ProfileError, ProfileStore, UserProfile};

/// Timeout applied to every request made to the identity provider.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when talking to the identity provider.
///
/// The variants distinguish a rejected credential from an unreachable
/// provider so callers can answer 401 and 503 respectively.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The bearer token is invalid, expired or revoked.
    #[error("unauthorized: invalid or expired token")]
    Unauthorized,

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider could not be reached.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with an unexpected status or body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The client could not be constructed.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// The requested document does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<IdentityError> for AuthError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthorized => AuthError::Rejected,
            other => AuthError::Unavailable(other.to_string()),
        }
    }
}

impl From<IdentityError> for ProfileError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound(id) => ProfileError::NotFound(id),
            other => ProfileError::Backend(other.to_string()),
        }
    }
}

/// Body of a successful `/auth/v1/user` response.
#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(flatten)]
    claims: Map<String, Value>,
}

impl From<UserResponse> for Identity {
    fn from(user: UserResponse) -> Self {
        Identity {
            uid: user.id,
            email: user.email,
            claims: user.claims,
        }
    }
}

/// Client for the identity provider.
///
/// Cheap to clone; the inner `reqwest::Client` shares its connection pool.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl IdentityClient {
    /// Creates a new client.
    ///
    /// Trailing slashes on `base_url` are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Configuration`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                IdentityError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// The provider base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a bearer token to the identity it belongs to.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::Unauthorized`] - the provider answered 401 or 403
    /// - [`IdentityError::Timeout`] / [`IdentityError::Unavailable`] - transport failure
    /// - [`IdentityError::InvalidResponse`] - any other status, or a body without `id`
    pub async fn fetch_identity(&self, token: &str) -> Result<Identity, IdentityError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        debug!(url = %url, "Verifying token with identity provider");

        let response = self
            .send(
                self.http_client
                    .get(&url)
                    .header("apikey", &self.api_key)
                    .bearer_auth(token),
            )
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(status = %status, "Token rejected by identity provider");
            return Err(IdentityError::Unauthorized);
        }
        let response = ensure_success(response, "auth").await?;

        let user: UserResponse = response.json().await.map_err(|e| {
            IdentityError::InvalidResponse(format!("failed to parse user response: {e}"))
        })?;

        debug!(user_id = %user.id, "Token verified");
        Ok(user.into())
    }

    /// Loads the profile document for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] if the store holds no such user.
    pub async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile, IdentityError> {
        let url = format!("{}/rest/v1/users", self.base_url);
        let id_filter = format!("eq.{user_id}");

        let response = self
            .send(
                self.http_client
                    .get(&url)
                    .header("apikey", &self.api_key)
                    .bearer_auth(&self.api_key)
                    .query(&[("id", id_filter.as_str()), ("select", "*")]),
            )
            .await?;
        let response = ensure_success(response, "profile read").await?;

        let mut rows: Vec<UserProfile> = response.json().await.map_err(|e| {
            IdentityError::InvalidResponse(format!("failed to parse profile response: {e}"))
        })?;

        if rows.len() > 1 {
            warn!(user_id = %user_id, rows = rows.len(), "Multiple profiles for one user id");
        }
        if rows.is_empty() {
            return Err(IdentityError::NotFound(user_id.to_string()));
        }
        Ok(rows.swap_remove(0))
    }

    /// Creates or replaces the profile document keyed by `profile.id`.
    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), IdentityError> {
        let url = format!("{}/rest/v1/users", self.base_url);
        debug!(user_id = %profile.id, "Writing user profile");

        let response = self
            .send(
                self.http_client
                    .post(&url)
                    .header("apikey", &self.api_key)
                    .bearer_auth(&self.api_key)
                    .header("Prefer", "resolution=merge-duplicates")
                    .json(profile),
            )
            .await?;
        ensure_success(response, "profile write").await?;
        Ok(())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, IdentityError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                IdentityError::Timeout(REQUEST_TIMEOUT)
            } else if e.is_connect() {
                IdentityError::Unavailable(format!("connection failed: {e}"))
            } else {
                IdentityError::Unavailable(format!("request failed: {e}"))
            }
        })
    }
}

/// Passes 2xx responses through and turns anything else into `InvalidResponse`.
async fn ensure_success(response: Response, operation: &str) -> Result<Response, IdentityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, operation, body = %body, "Unexpected response from identity provider");
    Err(IdentityError::InvalidResponse(format!(
        "unexpected status {status}: {body}"
    )))
}

#[async_trait]
impl TokenVerifier for IdentityClient {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.fetch_identity(token).await.map_err(|err| {
            if !matches!(err, IdentityError::Unauthorized) {
                warn!(error = %err, "Token verification unavailable");
            }
            AuthError::from(err)
        })
    }
}

#[async_trait]
impl ProfileStore for IdentityClient {
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, ProfileError> {
        Ok(self.fetch_profile(user_id).await?)
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<(), ProfileError> {
        Ok(self.upsert_profile(profile).await?)
    }
}
