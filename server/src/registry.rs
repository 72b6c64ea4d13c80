//! Connection registry for authenticated WebSocket sessions.
//!
//! The registry maps each user id to exactly one live session (last connect
//! wins) and tracks the topics that session is subscribed to. It is shared
//! between every connection task and the broadcast dispatcher.
//!
//! Each connection owns a [`ConnectionHandle`] pair:
//!
//! - a bounded frame channel that the connection's writer task drains
//! - a close signal that overrides pending frames
//!
//! Broadcasts never await on a handle; a full or closed channel is reported
//! as a [`DeliveryError`] for that recipient only.
//!
//! # Example
//!
//! ```rust
//! use sensorhub_server::registry::{ConnectionHandle, ConnectionRegistry};
//!
//! let registry = ConnectionRegistry::new();
//! let (handle, _outlet) = ConnectionHandle::channel(16);
//!
//! let session = registry.admit("user-1", handle);
//! registry.subscribe("user-1", session.handle.id(), &["s1".to_string()]);
//!
//! assert_eq!(registry.sessions_subscribed_to("s1").len(), 1);
//! assert!(registry.sessions_subscribed_to("s2").is_empty());
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Close code sent to a connection replaced by a newer one for the same user.
pub const CLOSE_CODE_REPLACED: u16 = 4002;

/// Close reason sent alongside [`CLOSE_CODE_REPLACED`].
pub const REASON_REPLACED: &str = "Session replaced";

/// Failure to hand a frame to a single connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,

    /// The connection's outbound buffer is full.
    #[error("outbound buffer full")]
    Full,
}

/// A request to close a connection with a WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: &'static str,
}

/// The next thing a connection's writer should put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Utf8Bytes),
    Close(CloseSignal),
}

/// Sending side of a connection, cloned into the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    frames: mpsc::Sender<Utf8Bytes>,
    close: Arc<watch::Sender<Option<CloseSignal>>>,
}

/// Receiving side of a connection, owned by its writer task.
#[derive(Debug)]
pub struct ConnectionOutlet {
    frames: mpsc::Receiver<Utf8Bytes>,
    close: watch::Receiver<Option<CloseSignal>>,
    close_open: bool,
}

impl ConnectionHandle {
    /// Creates a handle and its outlet with room for `capacity` queued frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn channel(capacity: usize) -> (Self, ConnectionOutlet) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            id: Uuid::new_v4(),
            frames: frames_tx,
            close: Arc::new(close_tx),
        };
        let outlet = ConnectionOutlet {
            frames: frames_rx,
            close: close_rx,
            close_open: true,
        };
        (handle, outlet)
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queues a frame without waiting.
    pub fn deliver(&self, frame: Utf8Bytes) -> Result<(), DeliveryError> {
        self.frames.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Queues a frame, waiting for room in this connection's own buffer.
    pub async fn send(&self, frame: Utf8Bytes) -> Result<(), DeliveryError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| DeliveryError::Closed)
    }

    /// Asks the writer to send a close frame and stop.
    ///
    /// The signal bypasses the frame buffer, so it is never lost to a full
    /// queue. Only the first signal is kept.
    pub fn close(&self, code: u16, reason: &'static str) {
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseSignal { code, reason });
            true
        });
    }

    /// Returns `true` once a close signal has been raised for this connection.
    pub fn is_close_requested(&self) -> bool {
        self.close.borrow().is_some()
    }

    /// Returns `true` once the writer has dropped its outlet.
    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

impl ConnectionOutlet {
    /// Waits for the next frame or close signal.
    ///
    /// A pending close signal wins over queued frames. Returns `None` once
    /// every handle has been dropped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            let pending = *self.close.borrow_and_update();
            if let Some(signal) = pending {
                return Some(Outbound::Close(signal));
            }

            tokio::select! {
                biased;
                changed = self.close.changed(), if self.close_open => {
                    if changed.is_err() {
                        self.close_open = false;
                    }
                }
                frame = self.frames.recv() => return frame.map(Outbound::Frame),
            }
        }
    }

    /// Takes a queued frame without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Utf8Bytes> {
        self.frames.try_recv().ok()
    }
}

/// A point-in-time view of one registered session.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub user_id: String,
    pub handle: ConnectionHandle,
}

#[derive(Debug)]
struct Session {
    handle: ConnectionHandle,
    // Insertion order is kept so acknowledgements and snapshots are stable.
    topics: Vec<String>,
    connected_at: DateTime<Utc>,
}

/// Shared map from user id to that user's live session.
///
/// Cloning is cheap; all clones see the same sessions.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session for `user_id`.
    ///
    /// Any previous session for the same user is replaced and its connection
    /// receives a close signal with [`CLOSE_CODE_REPLACED`].
    pub fn admit(&self, user_id: impl Into<String>, handle: ConnectionHandle) -> SessionRef {
        let user_id = user_id.into();
        let session = Session {
            handle: handle.clone(),
            topics: Vec::new(),
            connected_at: Utc::now(),
        };

        let previous = self.write().insert(user_id.clone(), session);

        if let Some(previous) = previous {
            if previous.handle.id() != handle.id() {
                info!(
                    user_id = %user_id,
                    evicted = %previous.handle.id(),
                    connection_id = %handle.id(),
                    "Replacing existing session"
                );
                previous.handle.close(CLOSE_CODE_REPLACED, REASON_REPLACED);
            }
        } else {
            info!(user_id = %user_id, connection_id = %handle.id(), "Session admitted");
        }

        SessionRef { user_id, handle }
    }

    /// Removes the session for `user_id`, whoever owns it.
    ///
    /// Returns `true` if a session was removed. Removing an absent user is a no-op.
    pub fn remove(&self, user_id: &str) -> bool {
        let removed = self.write().remove(user_id);
        if let Some(session) = &removed {
            debug!(
                user_id = %user_id,
                connection_id = %session.handle.id(),
                connected_for_secs = (Utc::now() - session.connected_at).num_seconds(),
                "Session removed"
            );
        }
        removed.is_some()
    }

    /// Removes the session for `user_id` only if `connection_id` still owns it.
    ///
    /// A connection that was replaced and closes late leaves its successor alone.
    pub fn remove_connection(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut sessions = self.write();
        let owner = sessions.get(user_id).map(|s| s.handle.id());
        match owner {
            Some(id) if id == connection_id => {
                sessions.remove(user_id);
                drop(sessions);
                debug!(user_id = %user_id, connection_id = %connection_id, "Session removed");
                true
            }
            Some(_) => {
                debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    "Superseded connection closed, keeping replacement"
                );
                false
            }
            None => false,
        }
    }

    /// Adds `topics` to the subscriptions of the session owned by `connection_id`.
    ///
    /// Topics already present are skipped. Returns `false` if the user has no
    /// session or a newer connection owns it; both happen when a frame races
    /// with close or eviction.
    pub fn subscribe(&self, user_id: &str, connection_id: Uuid, topics: &[String]) -> bool {
        let mut sessions = self.write();
        let Some(session) = owned_session(&mut sessions, user_id, connection_id) else {
            debug!(user_id = %user_id, connection_id = %connection_id, "Subscribe for stale session ignored");
            return false;
        };

        for topic in topics {
            if !session.topics.contains(topic) {
                session.topics.push(topic.clone());
            }
        }
        true
    }

    /// Removes `topics` from the subscriptions of the session owned by
    /// `connection_id`. Absent topics are skipped.
    pub fn unsubscribe(&self, user_id: &str, connection_id: Uuid, topics: &[String]) -> bool {
        let mut sessions = self.write();
        let Some(session) = owned_session(&mut sessions, user_id, connection_id) else {
            debug!(user_id = %user_id, connection_id = %connection_id, "Unsubscribe for stale session ignored");
            return false;
        };

        session.topics.retain(|topic| !topics.contains(topic));
        true
    }

    /// The user's current subscriptions, in the order they were first added.
    pub fn subscriptions(&self, user_id: &str) -> Option<Vec<String>> {
        self.read().get(user_id).map(|s| s.topics.clone())
    }

    /// Snapshot of every session subscribed to `topic`.
    ///
    /// Handles are cloned out under the read lock, so callers can send
    /// without holding it.
    pub fn sessions_subscribed_to(&self, topic: &str) -> Vec<SessionRef> {
        self.read()
            .iter()
            .filter(|(_, session)| session.topics.iter().any(|t| t == topic))
            .map(|(user_id, session)| SessionRef {
                user_id: user_id.clone(),
                handle: session.handle.clone(),
            })
            .collect()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.read().contains_key(user_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of distinct topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.read()
            .values()
            .flat_map(|s| s.topics.iter())
            .collect::<HashSet<_>>()
            .len()
    }
}

fn owned_session<'a>(
    sessions: &'a mut HashMap<String, Session>,
    user_id: &str,
    connection_id: Uuid,
) -> Option<&'a mut Session> {
    sessions
        .get_mut(user_id)
        .filter(|session| session.handle.id() == connection_id)
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("session_count", &self.len())
            .finish()
    }
}
