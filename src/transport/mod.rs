//! Transport layer for publishing
//!
//! This module provides the transport abstraction the publish loop drives,
//! the message type handed to it, and the MQTT implementation.

use crate::error::{ConnectionError, DisconnectError, PublishError};
use crate::observer::DeliveryObserver;
use crate::token::DeliveryToken;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosLevel {
    /// QoS 0: fire once, no acknowledgment
    AtMostOnce,
    /// QoS 1: acknowledged by PUBACK, may duplicate
    AtLeastOnce,
    /// QoS 2: four-way handshake, completed by PUBCOMP
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A single application message
///
/// Ownership moves into the transport on submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QosLevel,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Transport trait for the publish loop
///
/// This trait provides an abstraction over the broker connection so the
/// publish loop can run against the MQTT client or a test double.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session; resolves once the broker accepted it
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Tear the session down; resolves once DISCONNECT has gone out
    async fn disconnect(&mut self) -> Result<(), DisconnectError>;

    /// Submit a message and return its delivery token
    async fn publish(&self, message: Message) -> Result<DeliveryToken, PublishError> {
        self.publish_with_listener(message, None).await
    }

    /// Submit a message with a per-token listener that receives
    /// `on_success`/`on_failure` when the token resolves
    async fn publish_with_listener(
        &self,
        message: Message,
        listener: Option<Arc<dyn DeliveryObserver>>,
    ) -> Result<DeliveryToken, PublishError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state (None before the first connect)
    fn connection_state(&self) -> Option<ConnectionState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QosLevel::try_from(0), Ok(QosLevel::AtMostOnce));
        assert_eq!(QosLevel::try_from(1), Ok(QosLevel::AtLeastOnce));
        assert_eq!(QosLevel::try_from(2), Ok(QosLevel::ExactlyOnce));
        assert_eq!(QosLevel::try_from(3), Err(3));
    }

    #[test]
    fn test_qos_display_matches_wire_value() {
        for value in 0..=2u8 {
            let qos = QosLevel::try_from(value).unwrap();
            assert_eq!(qos.as_u8(), value);
            assert_eq!(qos.to_string(), value.to_string());
        }
    }

    #[test]
    fn test_message_new_accepts_string_payload() {
        let message = Message::new("TestTopic", "Sending message 0", QosLevel::ExactlyOnce, true);
        assert_eq!(message.topic, "TestTopic");
        assert_eq!(&message.payload[..], b"Sending message 0");
        assert!(message.retain);
    }
}
