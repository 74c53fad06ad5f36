//! Transport layer for message bus communication
//!
//! This module provides the wire-level capability the rest of the service
//! builds on, plus its MQTT implementation. The capability is deliberately
//! small: open a session, publish, (un)subscribe, close. Reconnection,
//! subscription replay and dispatch live one layer up in
//! [`crate::broker::BrokerConnection`].

use crate::routing::Message;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Use TLS for the transport
    pub tls: bool,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Events reported by a live transport session
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A message arrived on a subscribed topic
    Message(Message),
    /// The session ended; no further events follow on this channel
    ConnectionLost(String),
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe to '{pattern}' failed: {reason}")]
    Subscribe { pattern: String, reason: String },
    #[error("Unsubscribe from '{pattern}' failed: {reason}")]
    Unsubscribe { pattern: String, reason: String },
    #[error("Disconnect failed: {0}")]
    Disconnect(String),
}

/// Wire-level broker client capability
///
/// This trait provides an abstraction over the concrete bus client
/// (primarily MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Open a new session. Resolves once the broker acknowledged it.
    ///
    /// Inbound messages and the eventual loss of the session are reported on
    /// `events`. A previous session, if any, is discarded.
    async fn connect(&self, events: mpsc::Sender<InboundEvent>) -> Result<(), TransportError>;

    /// Close the current session. Closing an already closed session is a no-op.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Hand one message to the transport
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Register a topic filter with the broker for the current session
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Remove a topic filter from the current session
    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError>;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
