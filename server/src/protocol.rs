//! Per-connection subscription protocol.
//!
//! A [`Connection`] walks through a small state machine:
//!
//! ```text
//! Connecting --authenticate--> Authenticated --activate--> Active --close--> Closed
//!      \                                                                      ^
//!       `--------------------- missing or rejected token ---------------------'
//! ```
//!
//! While `Active`, every inbound frame is decoded as a [`ClientMessage`] and
//! answered with exactly one [`ServerMessage`]. Malformed frames get an
//! `error` reply and leave the connection open.

use axum::extract::ws::Utf8Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::registry::{ConnectionHandle, ConnectionRegistry, DeliveryError, SessionRef};
use crate::types::{ClientMessage, ServerMessage};

/// Close code for a handshake without a valid token.
pub const CLOSE_CODE_UNAUTHORIZED: u16 = 4001;

/// Text of the `error` reply sent for any undecodable frame.
pub const INVALID_FORMAT_MESSAGE: &str = "Invalid message format";

/// An inbound frame that is not a valid control message.
///
/// The detail is for logs only; clients always see [`INVALID_FORMAT_MESSAGE`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat(String),
}

/// Decodes a text or binary frame as a control message.
pub fn decode(raw: &[u8]) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_slice(raw).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
}

/// Lifecycle of a single WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Protocol driver for one WebSocket connection.
///
/// Dropping a `Connection` closes it, so the registry never keeps a session
/// whose driver has gone away.
#[derive(Debug)]
pub struct Connection {
    registry: ConnectionRegistry,
    handle: ConnectionHandle,
    state: ConnectionState,
    user_id: Option<String>,
}

impl Connection {
    pub fn new(registry: ConnectionRegistry, handle: ConnectionHandle) -> Self {
        Self {
            registry,
            handle,
            state: ConnectionState::Connecting,
            user_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The authenticated user, once past `Connecting`.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Verifies the handshake token.
    ///
    /// On failure the connection moves to `Closed` and its writer is told to
    /// close with code 4001 and the matching reason.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingToken`] - no token was supplied
    /// - [`AuthError::Rejected`] / [`AuthError::Unavailable`] - the verifier failed
    pub async fn authenticate(
        &mut self,
        verifier: &dyn TokenVerifier,
        token: Option<&str>,
    ) -> Result<Identity, AuthError> {
        if self.state != ConnectionState::Connecting {
            warn!(connection_id = %self.handle.id(), state = ?self.state, "Authenticate called twice");
            return Err(AuthError::Rejected);
        }

        let result = match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => verifier.verify(token).await,
            None => Err(AuthError::MissingToken),
        };

        match result {
            Ok(identity) => {
                debug!(connection_id = %self.handle.id(), user_id = %identity.uid, "Token verified");
                self.user_id = Some(identity.uid.clone());
                self.state = ConnectionState::Authenticated;
                Ok(identity)
            }
            Err(err) => {
                info!(
                    connection_id = %self.handle.id(),
                    reason = err.close_reason(),
                    error = %err,
                    "Rejecting WebSocket connection"
                );
                self.state = ConnectionState::Closed;
                self.handle
                    .close(CLOSE_CODE_UNAUTHORIZED, err.close_reason());
                Err(err)
            }
        }
    }

    /// Admits the authenticated user into the registry.
    ///
    /// Returns `None` unless the connection is `Authenticated`.
    pub fn activate(&mut self) -> Option<SessionRef> {
        if self.state != ConnectionState::Authenticated {
            return None;
        }
        let user_id = self.user_id.clone()?;
        let session = self.registry.admit(user_id, self.handle.clone());
        self.state = ConnectionState::Active;
        Some(session)
    }

    /// Applies one inbound frame and returns the reply to send.
    ///
    /// Returns `None` when the connection is not `Active`. A connection that
    /// no longer owns its session, typically because a newer connection for
    /// the same user replaced it, moves to `Closed` and answers nothing.
    pub fn handle_frame(&mut self, raw: &[u8]) -> Option<ServerMessage> {
        if self.state != ConnectionState::Active {
            return None;
        }
        if self.handle.is_close_requested() {
            self.close_superseded();
            return None;
        }
        let user_id = self.user_id.clone()?;
        let connection_id = self.handle.id();

        let message = match decode(raw) {
            Ok(message) => message,
            Err(ProtocolError::InvalidFormat(detail)) => {
                debug!(user_id = %user_id, error = %detail, "Invalid client message");
                return Some(ServerMessage::Error {
                    message: INVALID_FORMAT_MESSAGE.to_string(),
                });
            }
        };

        let (applied, reply) = match message {
            ClientMessage::Subscribe { sensor_ids } => {
                let applied = self.registry.subscribe(&user_id, connection_id, &sensor_ids);
                debug!(user_id = %user_id, sensor_ids = ?sensor_ids, applied, "Subscribed");
                (applied, ServerMessage::Subscribed { sensor_ids })
            }
            ClientMessage::Unsubscribe { sensor_ids } => {
                let applied = self.registry.unsubscribe(&user_id, connection_id, &sensor_ids);
                debug!(user_id = %user_id, sensor_ids = ?sensor_ids, applied, "Unsubscribed");
                (applied, ServerMessage::Unsubscribed { sensor_ids })
            }
            ClientMessage::Ping => (true, ServerMessage::Pong),
        };

        // The session was replaced or removed after the check above.
        if !applied {
            self.close_superseded();
            return None;
        }
        Some(reply)
    }

    /// Convenience wrapper over [`handle_frame`](Self::handle_frame) for text frames.
    pub fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        self.handle_frame(text.as_bytes())
    }

    /// Handles a frame and queues the reply on this connection's own buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] if the writer has gone away.
    pub async fn respond(&mut self, raw: &[u8]) -> Result<(), DeliveryError> {
        let Some(reply) = self.handle_frame(raw) else {
            return Ok(());
        };

        match reply.to_json() {
            Ok(json) => self.handle.send(Utf8Bytes::from(json)).await,
            Err(err) => {
                error!(error = %err, "Failed to serialize reply");
                Ok(())
            }
        }
    }

    /// Moves to `Closed` and removes this connection's session.
    ///
    /// Idempotent. A connection replaced by a newer one for the same user
    /// leaves the newer session in place.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(user_id) = &self.user_id {
            self.registry.remove_connection(user_id, self.handle.id());
            info!(user_id = %user_id, connection_id = %self.handle.id(), "Connection closed");
        }
        self.state = ConnectionState::Closed;
    }

    fn close_superseded(&mut self) {
        debug!(
            user_id = ?self.user_id,
            connection_id = %self.handle.id(),
            "Connection no longer owns its session, dropping frame"
        );
        self.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
