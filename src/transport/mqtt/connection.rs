//! Pure connection state management for MQTT client
//!
//! This module contains the immutable connection configuration, broker
//! address parsing, reconnection backoff and the mapping onto
//! `rumqttc::MqttOptions`.

use crate::error::ConnectionError;
use crate::transport::{Message, QosLevel};
use rumqttc::{LastWill, MqttOptions, QoS, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - handshake in progress
    Connecting,
    /// CONNACK accepted, ready to publish
    Connected,
    /// Connection dropped, reconnect attempt in progress (attempt count)
    Reconnecting(u32),
    /// Disconnected with reason
    Disconnected(String),
    /// Reconnect attempts exhausted
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Custom backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Host, port and transport security parsed from a broker URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://` (plain) or `ssl://`, `mqtts://` (TLS) URIs
    pub fn parse(broker_url: &str) -> Result<Self, ConnectionError> {
        let invalid = || ConnectionError::InvalidBrokerUrl(broker_url.to_string());
        let url = Url::parse(broker_url).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(invalid()),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Immutable connection configuration
///
/// Built once at startup through [`ConnectionConfig::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    broker_url: String,
    address: BrokerAddress,
    client_id: String,
    persist_dir: PathBuf,
    clean_session: bool,
    automatic_reconnect: bool,
    keep_alive: Duration,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    max_inflight: u16,
    credentials: Option<(String, String)>,
    last_will: Option<Message>,
    reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    pub fn builder(
        broker_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(broker_url, client_id)
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn automatic_reconnect(&self) -> bool {
        self.automatic_reconnect
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
    }

    pub fn max_inflight(&self) -> u16 {
        self.max_inflight
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(user, _)| user.as_str())
    }

    pub fn last_will(&self) -> Option<&Message> {
        self.last_will.as_ref()
    }

    pub fn reconnect(&self) -> &ReconnectConfig {
        &self.reconnect
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    broker_url: String,
    client_id: String,
    persist_dir: PathBuf,
    clean_session: bool,
    automatic_reconnect: bool,
    keep_alive: Duration,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    max_inflight: u16,
    credentials: Option<(String, String)>,
    last_will: Option<Message>,
    reconnect: ReconnectConfig,
}

impl ConnectionConfigBuilder {
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            persist_dir: PathBuf::from("/tmp/mqtt-persist"),
            clean_session: true,
            automatic_reconnect: false,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(2),
            max_inflight: 100,
            credentials: None,
            last_will: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn persist_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_dir = path.into();
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn automatic_reconnect(mut self, enabled: bool) -> Self {
        self.automatic_reconnect = enabled;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn max_inflight(mut self, max_inflight: u16) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn will(mut self, message: Message) -> Self {
        self.last_will = Some(message);
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<ConnectionConfig, ConnectionError> {
        let address = BrokerAddress::parse(&self.broker_url)?;

        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            return Err(ConnectionError::InvalidOptions(format!(
                "client id '{}' must be non-empty and not start with a space",
                self.client_id
            )));
        }
        if self.max_inflight == 0 {
            return Err(ConnectionError::InvalidOptions(
                "max_inflight must be greater than 0".to_string(),
            ));
        }
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(ConnectionError::InvalidOptions(
                "keep_alive must be zero or at least one second".to_string(),
            ));
        }
        if let Some(will) = &self.last_will {
            validate_topic_name(&will.topic).map_err(ConnectionError::InvalidOptions)?;
        }

        Ok(ConnectionConfig {
            broker_url: self.broker_url,
            address,
            client_id: self.client_id,
            persist_dir: self.persist_dir,
            clean_session: self.clean_session,
            automatic_reconnect: self.automatic_reconnect,
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            disconnect_timeout: self.disconnect_timeout,
            max_inflight: self.max_inflight,
            credentials: self.credentials,
            last_will: self.last_will,
            reconnect: self.reconnect,
        })
    }
}

/// Topic names for PUBLISH must be non-empty and wildcard free
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("topic '{topic}' must not contain wildcards"));
    }
    Ok(())
}

impl From<QosLevel> for QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Pure function to configure MQTT options from the connection config
pub fn configure_mqtt_options(config: &ConnectionConfig) -> MqttOptions {
    let address = config.address();
    let mut mqtt_options =
        MqttOptions::new(config.client_id(), address.host.clone(), address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = &config.credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_session(config.clean_session());
    mqtt_options.set_inflight(config.max_inflight());

    if let Some(will) = config.last_will() {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.to_vec(),
            will.qos.into(),
            will.retain,
        ));
    }

    mqtt_options
}

/// Make sure the persistence directory exists before connecting
pub fn ensure_persist_dir(path: &Path) -> Result<(), ConnectionError> {
    std::fs::create_dir_all(path).map_err(|source| ConnectionError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}
