//! SensorHub Server - Authenticated real-time sensor relay.
//!
//! This crate provides the realtime core of SensorHub, responsible for:
//! - Authenticating browser clients over WebSocket
//! - Tracking which sensors each connected user is subscribed to
//! - Pushing measurements and alerts to exactly those subscribers
//!
//! # Architecture
//!
//! Sensor producers post readings to the HTTP ingest endpoints. The
//! [`dispatch::Broadcaster`] looks up the current subscribers in the
//! [`registry::ConnectionRegistry`] and hands each of them the frame through
//! that connection's own outbound buffer. Nothing is persisted; a reading that
//! has no subscriber is dropped.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod types;
