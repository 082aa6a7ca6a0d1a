//! Pure connection health and reconnection decisions for MQTT client
//!
//! This module contains pure functions for reconnection decision making and
//! connection state transitions.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        automatic_reconnect: bool,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !automatic_reconnect {
            return ReconnectionDecision::AbortDisabled;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Connection event to publish after a network error (pure function)
    ///
    /// When a reconnect follows, the state goes straight to `Reconnecting`.
    pub fn event_after_error(
        decision: &ReconnectionDecision,
        reason: &str,
        max_attempts: Option<u32>,
    ) -> ConnectionEvent {
        match decision {
            ReconnectionDecision::Proceed { attempt, .. } => {
                ConnectionEvent::ReconnectionStarted(*attempt)
            }
            ReconnectionDecision::AbortShutdownRequested | ReconnectionDecision::AbortDisabled => {
                ConnectionEvent::NetworkError(reason.to_string())
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => ConnectionEvent::PermanentFailure(
                format!(
                    "Max reconnection attempts ({}) exceeded",
                    max_attempts.unwrap_or_default()
                ),
            ),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::ClientDisconnected => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    ///
    /// Publishing while reconnecting is allowed: requests queue up and go
    /// out once the session is back.
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Connected | ConnectionState::Reconnecting(_)
        )
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(attempt)) => {
                warn!("MQTT connection lost, starting reconnection attempt {}", attempt);
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!("Starting reconnection attempt {}", attempt);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!("MQTT connection permanently failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - automatic reconnect is off
    AbortDisabled,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Our DISCONNECT went out
    ClientDisconnected,
    /// Permanent failure - no more retries
    PermanentFailure(String),
}
