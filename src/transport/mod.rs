mod mqtt;

pub mod mock;

pub use mqtt::*;
pub use rumqttc::QoS;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport outbox is closed")]
    Closed,
    #[error("Transport client error: {0}")]
    Client(String),
}

/// A message delivered by the broker.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
    pub duplicate: bool,
    pub retain: bool,
    pub qos: QoS,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            duplicate: false,
            retain: false,
            qos: QoS::AtLeastOnce,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// A message the engine wants published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl OutgoingMessage {
    /// QoS 1, retained. Used for device and control metadata and values.
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    /// QoS 1, not retained. Used for commands and log lines.
    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// Outbound side of the publish/subscribe transport.
///
/// Every call is fire-and-forget: implementations queue the request and return
/// immediately, so the rule lane never waits on network I/O.
pub trait Transport: Send + Sync {
    fn publish(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Asks the transport to report back (out of band) once the retained
    /// backlog of all subscriptions issued so far has been delivered.
    fn request_sync(&self) -> Result<(), TransportError>;
}
