//! mqtt-loadpub
//!
//! Publishes a bounded stream of messages to an MQTT broker at a fixed
//! interval and reports how many were acknowledged.
//!
//! # Overview
//!
//! - [`transport`]: the [`Transport`] seam and the `rumqttc`-backed
//!   [`MqttClient`] (last will, clean session, automatic reconnect)
//! - [`token`]: per-message delivery tokens
//! - [`observer`]: connection-loss and delivery callbacks
//! - [`publisher`]: the publish loop with synchronous and fire-and-forget
//!   delivery policies
//! - [`config`]: TOML configuration with command-line overrides
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_loadpub::publisher::{DeliveryPolicy, PublishLoop, PublishSettings};
//! use mqtt_loadpub::testing::MockTransport;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let settings = PublishSettings {
//!     count: 3,
//!     interval: Duration::ZERO,
//!     policy: DeliveryPolicy::Synchronous,
//!     ..Default::default()
//! };
//!
//! let mut publish_loop = PublishLoop::new(MockTransport::new(), settings);
//! let report = publish_loop.run().await.unwrap();
//! assert_eq!(report.confirmed, 3);
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod observer;
pub mod publisher;
pub mod testing;
pub mod token;
pub mod transport;

pub use config::{ConfigOverrides, PublisherConfig};
pub use error::{
    ConfigError, ConnectionError, DisconnectError, PublishError, PublisherError, PublisherResult,
};
pub use observer::{CompositeObserver, DeliveryListener, DeliveryObserver, LoggingObserver};
pub use publisher::{DeliveryPolicy, LoopState, PublishLoop, PublishSettings, RunReport};
pub use token::{DeliveryStatus, DeliveryToken};
pub use transport::mqtt::MqttClient;
pub use transport::{Message, QosLevel, Transport};
