//! Publisher configuration
//!
//! Loaded from a TOML file with three sections, `[broker]`, `[will]` and
//! `[publish]`. Every key has a default, so an empty file (or no file at
//! all) yields a runnable configuration. Command-line flags and the
//! `MQTT_BROKER_URL` / `MQTT_CLIENT_ID` environment variables override file
//! values through [`ConfigOverrides`].

use crate::publisher::{DeliveryPolicy, PublishSettings};
use crate::transport::mqtt::connection::validate_topic_name;
use crate::transport::mqtt::{BrokerAddress, ConnectionConfig};
use crate::transport::{Message, QosLevel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::error::ConfigError;

/// Complete publisher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub broker: BrokerSection,
    pub will: WillSection,
    pub publish: PublishSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    /// Broker URI: tcp://, mqtt://, ssl:// or mqtts://
    pub url: String,
    pub client_id: String,
    /// Directory created at connect time for session persistence
    pub persist_dir: PathBuf,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    /// 0 disables keep-alive
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    pub max_inflight: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            client_id: "RandomLogDataPublisher".to_string(),
            persist_dir: PathBuf::from("/tmp/mqtt-persist"),
            clean_session: true,
            automatic_reconnect: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            disconnect_timeout_secs: 2,
            max_inflight: 100,
            username_env: None,
            password_env: None,
        }
    }
}

/// Last-will message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WillSection {
    /// Defaults to the publish topic
    pub topic: Option<String>,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for WillSection {
    fn default() -> Self {
        Self {
            topic: None,
            payload: "This is my last will".to_string(),
            qos: 2,
            retain: false,
        }
    }
}

/// What to publish and how
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PublishSection {
    pub topic: String,
    pub count: u64,
    pub interval_ms: u64,
    pub qos: u8,
    pub retain: bool,
    pub policy: DeliveryPolicy,
    /// Fire-and-forget only: wait for outstanding tokens before disconnecting
    pub drain_before_disconnect: bool,
    pub drain_timeout_secs: u64,
    pub progress_every: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            topic: "TestTopic".to_string(),
            count: 100_000,
            interval_ms: 100,
            qos: 2,
            retain: true,
            policy: DeliveryPolicy::Synchronous,
            drain_before_disconnect: true,
            drain_timeout_secs: 10,
            progress_every: 1000,
        }
    }
}

/// Values that take precedence over the file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub broker_url: Option<String>,
    pub client_id: Option<String>,
    pub persist_dir: Option<PathBuf>,
    pub topic: Option<String>,
    pub count: Option<u64>,
    pub interval_ms: Option<u64>,
    pub qos: Option<u8>,
    pub policy: Option<DeliveryPolicy>,
}

impl ConfigOverrides {
    /// Apply every value that is set
    pub fn apply(&self, config: &mut PublisherConfig) {
        if let Some(url) = &self.broker_url {
            config.broker.url = url.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.broker.client_id = client_id.clone();
        }
        if let Some(persist_dir) = &self.persist_dir {
            config.broker.persist_dir = persist_dir.clone();
        }
        if let Some(topic) = &self.topic {
            config.publish.topic = topic.clone();
        }
        if let Some(count) = self.count {
            config.publish.count = count;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.publish.interval_ms = interval_ms;
        }
        if let Some(qos) = self.qos {
            config.publish.qos = qos;
        }
        if let Some(policy) = self.policy {
            config.publish.policy = policy;
        }
    }
}

impl PublisherConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PublisherConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.broker.url).map_err(|e| ConfigError::invalid(e.to_string()))?;

        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::invalid("broker.client_id must not be empty"));
        }
        if self.broker.max_inflight == 0 {
            return Err(ConfigError::invalid("broker.max_inflight must be at least 1"));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "broker.connect_timeout_secs must be at least 1",
            ));
        }

        validate_topic_name(&self.publish.topic)
            .map_err(|e| ConfigError::invalid(format!("publish.topic: {e}")))?;
        if let Some(topic) = &self.will.topic {
            validate_topic_name(topic)
                .map_err(|e| ConfigError::invalid(format!("will.topic: {e}")))?;
        }

        parse_qos("publish.qos", self.publish.qos)?;
        parse_qos("will.qos", self.will.qos)?;

        Ok(())
    }

    /// Get MQTT username from environment variable
    pub fn mqtt_username(&self) -> Option<String> {
        get_env_var_optional(self.broker.username_env.as_deref())
    }

    /// Get MQTT password from environment variable
    pub fn mqtt_password(&self) -> Option<String> {
        get_env_var_optional(self.broker.password_env.as_deref())
    }

    /// The last-will message registered with the connection
    pub fn will_message(&self) -> Result<Message, ConfigError> {
        let topic = self
            .will
            .topic
            .clone()
            .unwrap_or_else(|| self.publish.topic.clone());
        Ok(Message::new(
            topic,
            self.will.payload.clone(),
            parse_qos("will.qos", self.will.qos)?,
            self.will.retain,
        ))
    }

    /// Build the transport configuration, resolving credentials now
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let broker = &self.broker;
        let mut builder = ConnectionConfig::builder(broker.url.clone(), broker.client_id.clone())
            .persist_dir(broker.persist_dir.clone())
            .clean_session(broker.clean_session)
            .automatic_reconnect(broker.automatic_reconnect)
            .keep_alive(Duration::from_secs(broker.keep_alive_secs))
            .connect_timeout(Duration::from_secs(broker.connect_timeout_secs))
            .disconnect_timeout(Duration::from_secs(broker.disconnect_timeout_secs))
            .max_inflight(broker.max_inflight)
            .will(self.will_message()?);

        match (self.mqtt_username(), self.mqtt_password()) {
            (Some(username), password) => {
                builder = builder.credentials(username, password.unwrap_or_default());
            }
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    "a password is configured but no username",
                ));
            }
            (None, None) => {}
        }

        builder
            .build()
            .map_err(|e| ConfigError::invalid(e.to_string()))
    }

    /// Settings for the publish loop
    pub fn publish_settings(&self) -> Result<PublishSettings, ConfigError> {
        let publish = &self.publish;
        Ok(PublishSettings {
            topic: publish.topic.clone(),
            count: publish.count,
            interval: Duration::from_millis(publish.interval_ms),
            qos: parse_qos("publish.qos", publish.qos)?,
            retain: publish.retain,
            policy: publish.policy,
            drain_before_disconnect: publish.drain_before_disconnect,
            drain_timeout: Duration::from_secs(publish.drain_timeout_secs),
            progress_every: publish.progress_every,
        })
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid(e.to_string()))
    }
}

fn parse_qos(field: &str, value: u8) -> Result<QosLevel, ConfigError> {
    QosLevel::try_from(value)
        .map_err(|v| ConfigError::invalid(format!("{field} must be 0, 1 or 2, got {v}")))
}

/// Helper method to get environment variable with consistent error handling
fn get_env_var_optional(env_var_name: Option<&str>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
