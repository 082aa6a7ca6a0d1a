//! Error types for the publisher
//!
//! Each stage of a run has its own error: the handshake ([`ConnectionError`]),
//! message submission and acknowledgment ([`PublishError`]) and teardown
//! ([`DisconnectError`]). [`PublisherError`] is the union the binary reports
//! before exiting with status 1.

use crate::transport::mqtt::ConnectionState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish a session with the broker
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),

    #[error("Cannot prepare persistence directory {path}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("No CONNACK received within {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Client is already connected")]
    AlreadyConnected,
}

/// Failure to submit a message or to get it acknowledged
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Publish request rejected")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Delivery failed for message {}: {reason}", display_message_id(.message_id))]
    Failed {
        message_id: Option<u16>,
        reason: String,
    },

    #[error("Delivery outcome lost: token dropped before resolution")]
    OutcomeLost,
}

/// Failure to tear the session down cleanly
#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("Disconnect request failed")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("DISCONNECT not written within {0:?}")]
    Timeout(Duration),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Top-level error for a publisher run
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Disconnect error: {0}")]
    Disconnect(#[from] DisconnectError),
}

/// Result type for publisher operations
pub type PublisherResult<T> = Result<T, PublisherError>;

/// Packet identifiers are absent for QoS 0; those are reported as -1.
pub(crate) fn display_message_id(message_id: &Option<u16>) -> i32 {
    message_id.map_or(-1, i32::from)
}
