//! MQTT transport built on `rumqttc`
//!
//! Pure functions are kept apart from I/O for testability:
//!
//! - [`connection`] - Connection state, options and broker address parsing
//! - [`message_handler`] - Routing of raw event-loop events
//! - [`delivery_tracker`] - Correlating submitted messages with acknowledgments
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_loadpub::observer::LoggingObserver;
//! use mqtt_loadpub::transport::mqtt::{ConnectionConfig, MqttClient};
//! use mqtt_loadpub::transport::{Message, QosLevel};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::builder("tcp://localhost:1883", "RandomLogDataPublisher")
//!     .build()?;
//!
//! let mut client = MqttClient::connect_with(config, Arc::new(LoggingObserver)).await?;
//! let mut token = client
//!     .publish_with_listener(
//!         Message::new("TestTopic", "Sending message 0", QosLevel::ExactlyOnce, true),
//!         None,
//!     )
//!     .await?;
//! token.wait().await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod delivery_tracker;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{
    BrokerAddress, ConnectionConfig, ConnectionConfigBuilder, ConnectionState, ReconnectConfig,
};
pub use delivery_tracker::DeliveryTracker;
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{AckKind, EventRoute, MessageHandler};
