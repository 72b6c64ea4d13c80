//! Server configuration module.
//!
//! Parses configuration from environment variables for the SensorHub server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SENSORHUB_IDENTITY_URL` | Yes* | - | Base URL of the identity provider |
//! | `SENSORHUB_IDENTITY_API_KEY` | Yes* | - | API key for the identity provider |
//! | `SENSORHUB_INGEST_TOKEN` | Yes* | - | Shared secret for sensor producers |
//! | `SENSORHUB_FRONTEND_URL` | No | `http://localhost:5173` | Allowed CORS origin |
//! | `SENSORHUB_OUTBOUND_BUFFER` | No | 256 | Per-connection outbound frame buffer |
//! | `PORT` | No | 5000 | HTTP server port |
//! | `SENSORHUB_UNSAFE_NO_AUTH` | No | false | Disable token verification (dev only) |
//!
//! *Not required if `SENSORHUB_UNSAFE_NO_AUTH=true`

use std::env;

use axum::http::HeaderValue;
use tracing::warn;

use crate::error::ConfigError;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 5000;

/// Default CORS origin (the web client's dev server).
const DEFAULT_FRONTEND_URL: &str = "http://localhost:5173";

/// Default number of frames buffered per connection before broadcasts are dropped.
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the identity provider (e.g., `https://identity.example.com`).
    pub identity_url: Option<String>,

    /// API key sent to the identity provider.
    pub identity_api_key: Option<String>,

    /// Shared secret sensor producers present to the ingest endpoints.
    pub ingest_token: Option<String>,

    /// Origin allowed by CORS.
    pub frontend_url: String,

    /// Capacity of each connection's outbound frame buffer.
    pub outbound_buffer: usize,

    /// HTTP server port.
    pub port: u16,

    /// When true, any non-empty token is accepted as the user id and ingest
    /// requests are not authenticated (development only).
    pub unsafe_no_auth: bool,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing (when `SENSORHUB_UNSAFE_NO_AUTH` is not true)
    /// - A value has an invalid format
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sensorhub_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            identity_url: non_empty_env("SENSORHUB_IDENTITY_URL"),
            identity_api_key: non_empty_env("SENSORHUB_IDENTITY_API_KEY"),
            ingest_token: non_empty_env("SENSORHUB_INGEST_TOKEN"),
            frontend_url: non_empty_env("SENSORHUB_FRONTEND_URL")
                .unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string()),
            outbound_buffer: parse_outbound_buffer()?,
            port: parse_port()?,
            unsafe_no_auth: parse_bool_env("SENSORHUB_UNSAFE_NO_AUTH"),
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "SENSORHUB_UNSAFE_NO_AUTH is enabled - token verification is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Creates a development configuration with authentication disabled.
    ///
    /// Used by tests and local tooling that do not read the environment.
    #[must_use]
    pub fn insecure() -> Self {
        Self {
            identity_url: None,
            identity_api_key: None,
            ingest_token: None,
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            port: 0,
            unsafe_no_auth: true,
        }
    }

    /// Validate the configuration.
    ///
    /// The frontend origin must always be a valid header value. Unless
    /// `unsafe_no_auth` is set, the identity provider and ingest secret must
    /// also be configured.
    fn validate(&self) -> Result<(), ConfigError> {
        if HeaderValue::from_str(&self.frontend_url).is_err() {
            return Err(ConfigError::invalid(
                "SENSORHUB_FRONTEND_URL",
                "not a valid origin header value",
            ));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.identity_url.is_none() {
            return Err(ConfigError::missing("SENSORHUB_IDENTITY_URL"));
        }

        if self.identity_api_key.is_none() {
            return Err(ConfigError::missing("SENSORHUB_IDENTITY_API_KEY"));
        }

        if self.ingest_token.is_none() {
            return Err(ConfigError::missing("SENSORHUB_INGEST_TOKEN"));
        }

        Ok(())
    }
}

/// Reads an environment variable, treating empty values as unset.
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => port_str
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid("PORT", format!("{e}"))),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid("PORT", "contains invalid unicode"))
        }
    }
}

/// Parse the SENSORHUB_OUTBOUND_BUFFER environment variable.
fn parse_outbound_buffer() -> Result<usize, ConfigError> {
    let Some(raw) = non_empty_env("SENSORHUB_OUTBOUND_BUFFER") else {
        return Ok(DEFAULT_OUTBOUND_BUFFER);
    };

    match raw.parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid(
            "SENSORHUB_OUTBOUND_BUFFER",
            "must be greater than zero",
        )),
        Ok(size) => Ok(size),
        Err(e) => Err(ConfigError::invalid("SENSORHUB_OUTBOUND_BUFFER", format!("{e}"))),
    }
}
