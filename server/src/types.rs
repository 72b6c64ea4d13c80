//! Wire message types for the SensorHub relay.
//!
//! Every frame is a JSON object tagged by a `type` field. Field names follow
//! the browser client's `camelCase` convention (`sensorIds`, `sensorId`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A control message sent by a client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Add topics to the connection's subscriptions.
    Subscribe {
        #[serde(rename = "sensorIds")]
        sensor_ids: Vec<String>,
    },

    /// Remove topics from the connection's subscriptions.
    Unsubscribe {
        #[serde(rename = "sensorIds")]
        sensor_ids: Vec<String>,
    },

    /// Application-level liveness check.
    Ping,
}

/// A frame sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        #[serde(rename = "sensorIds")]
        sensor_ids: Vec<String>,
    },
    Unsubscribed {
        #[serde(rename = "sensorIds")]
        sensor_ids: Vec<String>,
    },
    Pong,
    Error {
        message: String,
    },
    Measurement {
        data: Map<String, Value>,
    },
    Alert {
        data: Map<String, Value>,
    },
}

impl ServerMessage {
    /// Serializes the frame to its JSON text form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The kind of a [`BroadcastEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    Measurement,
    Alert,
}

impl BroadcastKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::Alert => "alert",
        }
    }
}

/// A payload pushed to every session subscribed to `sensor_id`.
///
/// Events are transient: they are fanned out once and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub kind: BroadcastKind,
    pub sensor_id: String,
    pub payload: Map<String, Value>,
}

impl BroadcastEvent {
    pub fn measurement(sensor_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: BroadcastKind::Measurement,
            sensor_id: sensor_id.into(),
            payload,
        }
    }

    pub fn alert(sensor_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: BroadcastKind::Alert,
            sensor_id: sensor_id.into(),
            payload,
        }
    }

    /// The topic this event is routed by.
    pub fn topic(&self) -> &str {
        &self.sensor_id
    }

    /// Builds the outbound frame.
    ///
    /// `data` starts with `sensorId` and then takes every payload field, so a
    /// payload key named `sensorId` replaces the topic value.
    pub fn to_message(&self) -> ServerMessage {
        let mut data = Map::with_capacity(self.payload.len() + 1);
        data.insert("sensorId".to_string(), Value::String(self.sensor_id.clone()));
        for (key, value) in &self.payload {
            data.insert(key.clone(), value.clone());
        }

        match self.kind {
            BroadcastKind::Measurement => ServerMessage::Measurement { data },
            BroadcastKind::Alert => ServerMessage::Alert { data },
        }
    }
}
