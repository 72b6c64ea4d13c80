//! Broadcast dispatcher.
//!
//! Fans a measurement or alert out to every session subscribed to its sensor
//! at the moment of the call. Delivery is fire-and-forget: each recipient is
//! handed the frame through its own bounded buffer, and a recipient that is
//! gone or full is logged and skipped without affecting the others.
//!
//! # Example
//!
//! ```rust
//! use sensorhub_server::dispatch::Broadcaster;
//! use sensorhub_server::registry::{ConnectionHandle, ConnectionRegistry};
//!
//! let registry = ConnectionRegistry::new();
//! let (handle, _outlet) = ConnectionHandle::channel(8);
//! let session = registry.admit("alice", handle);
//! registry.subscribe("alice", session.handle.id(), &["s1".to_string()]);
//!
//! let broadcaster = Broadcaster::new(registry);
//! let payload = serde_json::json!({ "v": 10 });
//! let report = broadcaster.broadcast_measurement("s1", payload.as_object().cloned().unwrap_or_default());
//!
//! assert_eq!(report.delivered, 1);
//! ```

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use crate::registry::ConnectionRegistry;
use crate::types::BroadcastEvent;

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Sessions subscribed to the topic when the broadcast started.
    pub recipients: usize,
    /// Sessions whose buffer accepted the frame.
    pub delivered: usize,
    /// Sessions that were closed or had a full buffer.
    pub failed: usize,
}

/// Pushes broadcast events to subscribed sessions.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Sends `{type:"measurement", data:{sensorId, ...measurement}}` to subscribers of `sensor_id`.
    pub fn broadcast_measurement(
        &self,
        sensor_id: &str,
        measurement: Map<String, Value>,
    ) -> DeliveryReport {
        self.broadcast(&BroadcastEvent::measurement(sensor_id, measurement))
    }

    /// Sends `{type:"alert", data:{sensorId, ...alert}}` to subscribers of `sensor_id`.
    pub fn broadcast_alert(&self, sensor_id: &str, alert: Map<String, Value>) -> DeliveryReport {
        self.broadcast(&BroadcastEvent::alert(sensor_id, alert))
    }

    /// Delivers `event` to the sessions subscribed to its topic right now.
    ///
    /// The frame is serialized once and shared between recipients.
    pub fn broadcast(&self, event: &BroadcastEvent) -> DeliveryReport {
        let recipients = self.registry.sessions_subscribed_to(event.topic());
        let mut report = DeliveryReport {
            recipients: recipients.len(),
            ..DeliveryReport::default()
        };

        if recipients.is_empty() {
            trace!(kind = event.kind.as_str(), sensor_id = %event.sensor_id, "No subscribers");
            return report;
        }

        let frame = match event.to_message().to_json() {
            Ok(json) => Utf8Bytes::from(json),
            Err(err) => {
                error!(error = %err, sensor_id = %event.sensor_id, "Failed to serialize broadcast");
                report.failed = report.recipients;
                return report;
            }
        };

        for session in recipients {
            match session.handle.deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        user_id = %session.user_id,
                        connection_id = %session.handle.id(),
                        kind = event.kind.as_str(),
                        sensor_id = %event.sensor_id,
                        error = %err,
                        "Dropped broadcast for session"
                    );
                }
            }
        }

        debug!(
            kind = event.kind.as_str(),
            sensor_id = %event.sensor_id,
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast dispatched"
        );
        report
    }
}
