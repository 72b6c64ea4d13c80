//! SensorHub Server - Main entry point.
//!
//! This binary starts the SensorHub relay with:
//! - Structured JSON logging
//! - Token verification against the identity provider
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`sensorhub_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (token is used as the user id)
//! SENSORHUB_UNSAFE_NO_AUTH=true cargo run --bin sensorhub-server
//!
//! # Production mode
//! SENSORHUB_IDENTITY_URL="https://identity.example.com" \
//! SENSORHUB_IDENTITY_API_KEY="public-api-key" \
//! SENSORHUB_INGEST_TOKEN="producer-secret" \
//! PORT=5000 \
//! cargo run --release --bin sensorhub-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use sensorhub_server::auth::{InsecureTokenVerifier, TokenVerifier};
use sensorhub_server::config::Config;
use sensorhub_server::identity::IdentityClient;
use sensorhub_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  SENSORHUB_IDENTITY_URL      - Base URL of the identity provider");
            eprintln!("  SENSORHUB_IDENTITY_API_KEY  - API key for the identity provider");
            eprintln!("  SENSORHUB_INGEST_TOKEN      - Shared secret for sensor producers");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                        - HTTP server port (default: 5000)");
            eprintln!("  SENSORHUB_FRONTEND_URL      - Allowed CORS origin");
            eprintln!("  SENSORHUB_OUTBOUND_BUFFER   - Frames buffered per connection (default: 256)");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            eprintln!("  SENSORHUB_UNSAFE_NO_AUTH    - Disable auth (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "Server exited with error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let verifier = build_verifier(&config)?;

    info!(
        port = config.port,
        auth_mode = if config.unsafe_no_auth { "disabled (UNSAFE)" } else { "enabled" },
        frontend_url = %config.frontend_url,
        outbound_buffer = config.outbound_buffer,
        "SensorHub server starting"
    );

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let app = create_router(AppState::new(config, verifier));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(address = %bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shutting down gracefully");
    Ok(())
}

fn build_verifier(config: &Config) -> Result<Arc<dyn TokenVerifier>> {
    if config.unsafe_no_auth {
        warn!("Using insecure token verifier: tokens are trusted as user ids");
        return Ok(Arc::new(InsecureTokenVerifier));
    }

    let url = config
        .identity_url
        .as_deref()
        .context("SENSORHUB_IDENTITY_URL is not set")?;
    let api_key = config
        .identity_api_key
        .as_deref()
        .context("SENSORHUB_IDENTITY_API_KEY is not set")?;

    let client = IdentityClient::new(url, api_key).context("failed to create identity client")?;
    info!(identity_url = %client.base_url(), "Identity provider configured");
    Ok(Arc::new(client))
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
