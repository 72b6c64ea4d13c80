//! End-to-end tests for the realtime relay.
//!
//! Each test binds a real server to `127.0.0.1:0`, connects WebSocket clients
//! with tokio-tungstenite and drives the subscription protocol over the wire.
//! Most tests run with `Config::insecure()`, where the handshake token is
//! used as the user id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use sensorhub_server::auth::{AuthError, Identity, TokenVerifier};
use sensorhub_server::config::Config;
use sensorhub_server::routes::{create_router, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Accepts exactly one token, `good-token`, as user `verified-user`.
struct SingleTokenVerifier;

#[async_trait]
impl TokenVerifier for SingleTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token == "good-token" {
            Ok(Identity::new("verified-user"))
        } else {
            Err(AuthError::Rejected)
        }
    }
}

fn insecure_state() -> AppState {
    AppState::new(Config::insecure(), Arc::new(sensorhub_server::auth::InsecureTokenVerifier))
}

/// Spawns a server for `state` and returns its address.
async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let url = format!("ws://{addr}/ws{query}");
    let (socket, _) = timeout(STEP_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("handshake failed");
    socket
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Returns the next text frame as JSON, skipping transport keepalives.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(STEP_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Returns the close code and reason the server sent.
async fn expect_close(socket: &mut Socket) -> (u16, String) {
    loop {
        let message = timeout(STEP_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("websocket error");
        match message {
            Message::Close(Some(frame)) => {
                return (u16::from(frame.code), frame.reason.as_str().to_string())
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

/// Subscribes and waits for the acknowledgement.
async fn subscribe(socket: &mut Socket, sensor_ids: &[&str]) {
    send_json(socket, json!({"type": "subscribe", "sensorIds": sensor_ids})).await;
    assert_eq!(
        next_json(socket).await,
        json!({"type": "subscribed", "sensorIds": sensor_ids})
    );
}

/// Round-trips a ping so the connection is known to be admitted.
async fn ping(socket: &mut Socket) {
    send_json(socket, json!({"type": "ping"})).await;
    assert_eq!(next_json(socket).await, json!({"type": "pong"}));
}

/// Asserts nothing arrives on `socket` for a short while.
async fn assert_silent(socket: &mut Socket) {
    let result = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

fn payload(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn missing_token_closes_with_4001_unauthorized() {
    let addr = spawn_server(insecure_state()).await;
    let mut socket = connect(addr, "").await;

    assert_eq!(expect_close(&mut socket).await, (4001, "Unauthorized".to_string()));
}

#[tokio::test]
async fn empty_token_counts_as_missing() {
    let addr = spawn_server(insecure_state()).await;
    let mut socket = connect(addr, "?token=").await;

    assert_eq!(expect_close(&mut socket).await, (4001, "Unauthorized".to_string()));
}

#[tokio::test]
async fn rejected_token_closes_with_4001_verification_failed() {
    let state = AppState::new(Config::insecure(), Arc::new(SingleTokenVerifier));
    let addr = spawn_server(state.clone()).await;
    let mut socket = connect(addr, "?token=bad-token").await;

    assert_eq!(
        expect_close(&mut socket).await,
        (4001, "Token verification failed".to_string())
    );
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn verified_token_admits_verified_uid() {
    let state = AppState::new(Config::insecure(), Arc::new(SingleTokenVerifier));
    let addr = spawn_server(state.clone()).await;
    let mut socket = connect(addr, "?token=good-token").await;

    ping(&mut socket).await;
    assert!(state.registry.contains("verified-user"));
}

#[tokio::test]
async fn authorization_header_is_accepted() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer header-user".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ping(&mut socket).await;
    assert!(state.registry.contains("header-user"));
}

// ============================================================================
// Subscription protocol
// ============================================================================

#[tokio::test]
async fn ping_yields_exactly_one_pong() {
    let addr = spawn_server(insecure_state()).await;
    let mut socket = connect(addr, "?token=alice").await;

    ping(&mut socket).await;
    assert_silent(&mut socket).await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_stays_open() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;
    let mut socket = connect(addr, "?token=alice").await;
    subscribe(&mut socket, &["s1"]).await;

    socket
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "message": "Invalid message format"})
    );

    send_json(&mut socket, json!({"type": "subscribe", "sensorIds": "s2"})).await;
    assert_eq!(next_json(&mut socket).await["type"], "error");

    assert_eq!(
        state.registry.subscriptions("alice"),
        Some(vec!["s1".to_string()])
    );
    ping(&mut socket).await;
}

#[tokio::test]
async fn binary_frames_are_decoded_like_text() {
    let addr = spawn_server(insecure_state()).await;
    let mut socket = connect(addr, "?token=alice").await;

    socket
        .send(Message::Binary(br#"{"type":"ping"}"#.to_vec().into()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;
    let mut socket = connect(addr, "?token=alice").await;
    subscribe(&mut socket, &["s1", "s2"]).await;

    send_json(&mut socket, json!({"type": "unsubscribe", "sensorIds": ["s1"]})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "unsubscribed", "sensorIds": ["s1"]})
    );

    let report = state
        .broadcaster
        .broadcast_measurement("s1", payload(json!({"v": 1})));
    assert_eq!(report.recipients, 0);
    assert_silent(&mut socket).await;
}

// ============================================================================
// Broadcast fan-out
// ============================================================================

#[tokio::test]
async fn measurements_reach_exactly_the_subscribers() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;
    let mut a = connect(addr, "?token=user-a").await;
    let mut b = connect(addr, "?token=user-b").await;
    subscribe(&mut a, &["s1", "s2"]).await;
    subscribe(&mut b, &["s2"]).await;

    let report = state
        .broadcaster
        .broadcast_measurement("s1", payload(json!({"v": 10})));
    assert_eq!(report.delivered, 1);
    assert_eq!(
        next_json(&mut a).await,
        json!({"type": "measurement", "data": {"sensorId": "s1", "v": 10}})
    );
    assert_silent(&mut b).await;

    let report = state
        .broadcaster
        .broadcast_measurement("s2", payload(json!({"v": 20})));
    assert_eq!(report.delivered, 2);
    let expected = json!({"type": "measurement", "data": {"sensorId": "s2", "v": 20}});
    assert_eq!(next_json(&mut a).await, expected);
    assert_eq!(next_json(&mut b).await, expected);
}

#[tokio::test]
async fn ingest_endpoint_pushes_alert_to_subscriber() {
    let state = insecure_state();
    let addr = spawn_server(state).await;
    let mut socket = connect(addr, "?token=alice").await;
    subscribe(&mut socket, &["boiler-1"]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/sensors/boiler-1/alerts"))
        .json(&json!({"level": "critical", "temperature": 98.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let report: Value = response.json().await.unwrap();
    assert_eq!(report["delivered"], 1);

    assert_eq!(
        next_json(&mut socket).await,
        json!({
            "type": "alert",
            "data": {"sensorId": "boiler-1", "level": "critical", "temperature": 98.5}
        })
    );
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn second_connection_for_user_evicts_first() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;

    let mut first = connect(addr, "?token=alice").await;
    subscribe(&mut first, &["s1"]).await;

    let mut second = connect(addr, "?token=alice").await;
    ping(&mut second).await;

    assert_eq!(
        expect_close(&mut first).await,
        (4002, "Session replaced".to_string())
    );
    assert_eq!(state.registry.len(), 1);
    assert_eq!(state.registry.subscriptions("alice"), Some(vec![]));

    // The replaced connection closing must not remove its successor.
    drop(first);
    sleep(Duration::from_millis(100)).await;
    assert!(state.registry.contains("alice"));
    ping(&mut second).await;
}

#[tokio::test]
async fn replaced_connection_cannot_change_successor_subscriptions() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;

    let mut first = connect(addr, "?token=alice").await;
    ping(&mut first).await;

    let mut second = connect(addr, "?token=alice").await;
    subscribe(&mut second, &["mine"]).await;

    // The close frame is still unread, so the client keeps writing. The server
    // may already have dropped the socket, so send errors are expected.
    let _ = first
        .send(Message::Text(
            json!({"type": "subscribe", "sensorIds": ["injected"]}).to_string().into(),
        ))
        .await;
    let _ = first
        .send(Message::Text(
            json!({"type": "unsubscribe", "sensorIds": ["mine"]}).to_string().into(),
        ))
        .await;

    while let Ok(Some(Ok(message))) = timeout(STEP_TIMEOUT, first.next()).await {
        assert!(
            !matches!(message, Message::Text(_)),
            "replaced connection got a reply: {message:?}"
        );
    }

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        state.registry.subscriptions("alice"),
        Some(vec!["mine".to_string()])
    );
    let report = state
        .broadcaster
        .broadcast_measurement("injected", payload(json!({"v": 1})));
    assert_eq!(report.recipients, 0);

    state
        .broadcaster
        .broadcast_measurement("mine", payload(json!({"v": 2})));
    assert_eq!(
        next_json(&mut second).await,
        json!({"type": "measurement", "data": {"sensorId": "mine", "v": 2}})
    );
}

#[tokio::test]
async fn closed_connection_is_removed_and_receives_nothing() {
    let state = insecure_state();
    let addr = spawn_server(state.clone()).await;
    let mut socket = connect(addr, "?token=alice").await;
    subscribe(&mut socket, &["s1"]).await;

    socket.close(None).await.unwrap();

    let registry = state.registry.clone();
    wait_until(|| registry.is_empty()).await;

    let report = state
        .broadcaster
        .broadcast_measurement("s1", payload(json!({"v": 1})));
    assert_eq!(report.recipients, 0);
}

#[tokio::test]
async fn health_reflects_live_sessions() {
    let state = insecure_state();
    let addr = spawn_server(state).await;
    let mut socket = connect(addr, "?token=alice").await;
    subscribe(&mut socket, &["s1", "s2"]).await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["topics"], 2);
}
