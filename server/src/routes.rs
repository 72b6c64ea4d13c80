//! HTTP route handlers for the SensorHub server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - Authenticated WebSocket subscription endpoint
//! - `GET /health` - Health check endpoint
//! - `POST /sensors/{sensor_id}/measurements` - Ingest a measurement from a producer
//! - `POST /sensors/{sensor_id}/alerts` - Ingest an alert from a producer
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including auth settings)
//! - The connection registry and the broadcaster that reads from it
//! - The token verifier used for WebSocket handshakes
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensorhub_server::auth::InsecureTokenVerifier;
//! use sensorhub_server::config::Config;
//! use sensorhub_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::new(Config::insecure(), Arc::new(InsecureTokenVerifier));
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        DefaultBodyLimit, Path, Query, State, WebSocketUpgrade,
    },
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{timeout, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, extract_token, validate_token, AuthError, TokenVerifier};
use crate::config::Config;
use crate::dispatch::{Broadcaster, DeliveryReport};
use crate::error::ServerError;
use crate::protocol::{Connection, ConnectionState};
use crate::registry::{ConnectionHandle, ConnectionOutlet, ConnectionRegistry, Outbound};
use crate::types::{BroadcastEvent, BroadcastKind};

/// Maximum body size for producer ingest (64 KB).
const MAX_BODY_SIZE: usize = 64 * 1024;

/// How long a finished connection waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Live WebSocket sessions and their subscriptions.
    pub registry: ConnectionRegistry,

    /// Dispatcher for measurements and alerts.
    pub broadcaster: Broadcaster,

    /// Verifier for WebSocket handshake tokens.
    pub verifier: Arc<dyn TokenVerifier>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with an empty registry.
    #[must_use]
    pub fn new(config: Config, verifier: Arc<dyn TokenVerifier>) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            config: Arc::new(config),
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            verifier,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("registry", &self.registry)
            .field("verifier", &"<TokenVerifier>")
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes and layers configured.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.frontend_url);

    // Only the path is recorded; the query string may carry a bearer token.
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
                version = ?request.version()
            )
        });

    Router::new()
        .route("/sensors/{sensor_id}/measurements", post(post_measurement))
        .route("/sensors/{sensor_id}/alerts", post(post_alert))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    match HeaderValue::from_str(frontend_url) {
        Ok(origin) => base.allow_origin(origin),
        Err(err) => {
            warn!(error = %err, "Invalid frontend origin, cross-origin requests disabled");
            base
        }
    }
}

// ============================================================================
// GET /ws - WebSocket Subscription
// ============================================================================

/// Query parameters accepted on the WebSocket handshake.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    /// Bearer token; takes precedence over the `Authorization` header.
    pub token: Option<String>,
}

/// GET /ws - WebSocket subscription endpoint.
///
/// The upgrade always succeeds. Authentication happens on the open socket so
/// failures can be reported with close code 4001 and a reason the browser can
/// read.
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = extract_token(params.token.as_deref(), &headers);
    debug!(has_token = token.is_some(), "WebSocket client connecting");

    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Drives one WebSocket connection from authentication to close.
async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let (handle, outlet) = ConnectionHandle::channel(state.config.outbound_buffer);
    let connection_id = handle.id();
    let (sink, mut stream) = socket.split();
    let mut connection = Connection::new(state.registry.clone(), handle);

    let mut writer = tokio::spawn(write_frames(sink, outlet));

    let authenticated = connection
        .authenticate(state.verifier.as_ref(), token.as_deref())
        .await
        .is_ok();

    if authenticated && connection.activate().is_some() {
        let reader = async {
            while let Some(message) = stream.next().await {
                let outcome = match message {
                    Ok(Message::Text(text)) => connection.respond(text.as_str().as_bytes()).await,
                    Ok(Message::Binary(bytes)) => connection.respond(&bytes).await,
                    Ok(Message::Close(_)) => {
                        debug!(connection_id = %connection_id, "Client sent close frame");
                        break;
                    }
                    // Transport-level keepalive, answered by axum.
                    Ok(Message::Ping(_) | Message::Pong(_)) => Ok(()),
                    Err(err) => {
                        debug!(connection_id = %connection_id, error = %err, "WebSocket error");
                        break;
                    }
                };
                if outcome.is_err() || connection.state() == ConnectionState::Closed {
                    break;
                }
            }
        };

        tokio::select! {
            _ = &mut writer => {}
            () = reader => {}
        }
    }

    connection.close();
    drop(connection);

    // Give the writer a chance to flush a pending close frame.
    if !writer.is_finished() && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(connection_id = %connection_id, "WebSocket connection finished");
}

/// Forwards queued frames to the socket until a close signal or send failure.
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outlet: ConnectionOutlet) {
    while let Some(outbound) = outlet.recv().await {
        match outbound {
            Outbound::Frame(text) => {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(error = %err, "Failed to send frame");
                    break;
                }
            }
            Outbound::Close(signal) => {
                let frame = CloseFrame {
                    code: signal.code,
                    reason: signal.reason.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %err, "Failed to send close frame");
                }
                break;
            }
        }
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live WebSocket sessions.
    pub connections: usize,

    /// Number of distinct topics with at least one subscriber.
    pub topics: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len(),
        topics: state.registry.topic_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// POST /sensors/{sensor_id}/... - Producer Ingest
// ============================================================================

/// POST /sensors/{sensor_id}/measurements
///
/// # Responses
///
/// - `202 Accepted` - broadcast dispatched, body is the [`DeliveryReport`]
/// - `400 Bad Request` - body is not a JSON object
/// - `401 Unauthorized` - missing or wrong ingest token
async fn post_measurement(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeliveryReport>), ServerError> {
    ingest(&state, BroadcastKind::Measurement, sensor_id, &headers, &body)
}

/// POST /sensors/{sensor_id}/alerts
///
/// Same contract as the measurement endpoint.
async fn post_alert(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeliveryReport>), ServerError> {
    ingest(&state, BroadcastKind::Alert, sensor_id, &headers, &body)
}

fn ingest(
    state: &AppState,
    kind: BroadcastKind,
    sensor_id: String,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(StatusCode, Json<DeliveryReport>), ServerError> {
    authorize_producer(&state.config, headers)?;

    let payload = parse_payload(body).inspect_err(|err| {
        debug!(sensor_id = %sensor_id, kind = kind.as_str(), error = %err, "Rejected ingest payload");
    })?;

    let event = match kind {
        BroadcastKind::Measurement => BroadcastEvent::measurement(sensor_id, payload),
        BroadcastKind::Alert => BroadcastEvent::alert(sensor_id, payload),
    };
    let report = state.broadcaster.broadcast(&event);

    info!(
        sensor_id = %event.sensor_id,
        kind = kind.as_str(),
        recipients = report.recipients,
        failed = report.failed,
        "Ingested broadcast"
    );
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// Checks the producer's bearer token against the configured ingest secret.
fn authorize_producer(config: &Config, headers: &HeaderMap) -> Result<(), ServerError> {
    if config.unsafe_no_auth {
        return Ok(());
    }

    let Some(expected) = config.ingest_token.as_deref() else {
        error!("Ingest token not configured but auth is enabled");
        return Err(ServerError::internal("ingest token not configured"));
    };

    let provided = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    validate_token(&provided, expected).inspect_err(|_| {
        warn!("Ingest request with invalid token");
    })?;
    Ok(())
}

fn parse_payload(body: &[u8]) -> Result<Map<String, Value>, ServerError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ServerError::validation("payload must be a JSON object")),
        Err(err) => Err(ServerError::validation(format!("invalid JSON: {err}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================
