//! Impure I/O operations for MQTT client
//!
//! This module owns the `rumqttc` client and the background task that polls
//! its event loop. The task resolves delivery tokens, reports connection
//! loss to the session observer and drives automatic reconnection.

use super::connection::{
    configure_mqtt_options, ensure_persist_dir, ConnectionConfig, ConnectionState,
    ReconnectConfig,
};
use super::delivery_tracker::DeliveryTracker;
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::{ConnectionError, DisconnectError, PublishError};
use crate::observer::DeliveryObserver;
use crate::token::{delivery_token, DeliveryToken, TokenCompleter};
use crate::transport::{Message, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request queue between client and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

type HandshakeSender = oneshot::Sender<Result<(), ConnectionError>>;

/// MQTT publishing client
pub struct MqttClient {
    config: ConnectionConfig,
    observer: Arc<dyn DeliveryObserver>,
    client: Mutex<AsyncClient>,
    event_loop: Mutex<Option<EventLoop>>,
    tracker: Arc<StdMutex<DeliveryTracker>>,
    next_token_id: AtomicU64,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    closing_tx: Option<watch::Sender<bool>>,
}

impl MqttClient {
    /// Create a client; nothing touches the network until [`connect`](Self::connect)
    pub fn new(config: ConnectionConfig, observer: Arc<dyn DeliveryObserver>) -> Self {
        let (client, event_loop) = Self::create_connection(&config);

        MqttClient {
            config,
            observer,
            client: Mutex::new(client),
            event_loop: Mutex::new(Some(event_loop)),
            tracker: Arc::new(StdMutex::new(DeliveryTracker::new())),
            next_token_id: AtomicU64::new(1),
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            closing_tx: None,
        }
    }

    /// Create a client and connect it in one call
    pub async fn connect_with(
        config: ConnectionConfig,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Result<Self, ConnectionError> {
        let mut client = Self::new(config, observer);
        client.connect().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of tokens still waiting for an outcome
    pub fn pending_deliveries(&self) -> usize {
        lock_tracker(&self.tracker).pending()
    }

    fn create_connection(config: &ConnectionConfig) -> (AsyncClient, EventLoop) {
        AsyncClient::new(configure_mqtt_options(config), REQUEST_CHANNEL_CAPACITY)
    }

    /// Create connection state and closing channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let closing_channels = watch::channel(false);
        (state_channels, closing_channels)
    }

    /// Wait for the background task to report the handshake outcome
    async fn wait_for_handshake(
        handshake_rx: oneshot::Receiver<Result<(), ConnectionError>>,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Failed(
                "event loop stopped before CONNACK".to_string(),
            )),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    fn is_running(&self) -> bool {
        self.event_loop_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Connect to the broker and wait for the CONNACK
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_running() {
            return Err(ConnectionError::AlreadyConnected);
        }

        ensure_persist_dir(self.config.persist_dir())?;

        // A previous attempt consumed the event loop; start from a fresh one.
        let event_loop = match self.event_loop.get_mut().take() {
            Some(event_loop) => event_loop,
            None => {
                let (client, event_loop) = Self::create_connection(&self.config);
                *self.client.get_mut() = client;
                event_loop
            }
        };

        let ((state_tx, state_rx), (closing_tx, closing_rx)) = Self::setup_connection_channels();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        self.state_rx = Some(state_rx);
        self.state_tx = Some(state_tx.clone());
        self.closing_tx = Some(closing_tx);

        let task = EventLoopTask {
            client_id: self.config.client_id().to_string(),
            automatic_reconnect: self.config.automatic_reconnect(),
            reconnect: self.config.reconnect().clone(),
            state_tx,
            closing_rx,
            tracker: self.tracker.clone(),
            observer: self.observer.clone(),
            handshake: Some(handshake_tx),
            connected: false,
        };

        info!(
            broker = %self.config.broker_url(),
            client_id = %self.config.client_id(),
            clean_session = self.config.clean_session(),
            "Connecting to MQTT broker"
        );
        self.event_loop_handle = Some(tokio::spawn(task.run(event_loop)));

        let span = crate::mqtt_span!(operation = "connect", client_id = %self.config.client_id());
        let result = Self::wait_for_handshake(handshake_rx, self.config.connect_timeout())
            .instrument(span)
            .await;
        if let Err(e) = &result {
            error!("MQTT connection failed: {}", e);
            self.stop_event_loop(format!("Connection failed: {e}"));
        }
        result
    }

    fn stop_event_loop(&mut self, reason: String) {
        if let Some(closing_tx) = &self.closing_tx {
            let _ = closing_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(ConnectionState::Disconnected(reason));
        }
    }

    /// Send DISCONNECT and wait for the event loop to write it
    pub async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        let Some(mut handle) = self.event_loop_handle.take() else {
            debug!("Disconnect on a client that never connected");
            return Ok(());
        };
        if handle.is_finished() {
            info!("MQTT event loop already stopped");
            return Ok(());
        }

        if let Some(closing_tx) = &self.closing_tx {
            let _ = closing_tx.send(true);
        }

        info!(client_id = %self.config.client_id(), "Disconnecting from MQTT broker");
        let request = self.client.lock().await.disconnect().await;
        if let Err(e) = request {
            handle.abort();
            self.stop_event_loop("Disconnect request failed".to_string());
            return Err(DisconnectError::Request(Box::new(e)));
        }

        let timeout = self.config.disconnect_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!("MQTT client disconnected");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Event loop task ended with error: {}", e);
                Ok(())
            }
            Err(_) => {
                warn!("DISCONNECT not written in time, aborting event loop");
                handle.abort();
                self.stop_event_loop("Disconnect timed out".to_string());
                Err(DisconnectError::Timeout(timeout))
            }
        }
    }

    /// Get current connection state
    /// Returns None if connection hasn't been attempted yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), PublishError> {
        let state = self
            .connection_state()
            .unwrap_or_else(|| ConnectionState::Disconnected("Never connected".to_string()));

        if !HealthMonitor::can_publish(&state) {
            return Err(PublishError::NotConnected { state });
        }
        Ok(())
    }

    /// Submit a message; the returned token resolves on acknowledgment
    pub async fn publish_with_listener(
        &self,
        message: Message,
        listener: Option<Arc<dyn DeliveryObserver>>,
    ) -> Result<DeliveryToken, PublishError> {
        self.check_connection_state()?;

        let token_id = self.next_token_id.fetch_add(1, Ordering::Relaxed);
        let (completer, token) = delivery_token(token_id, listener);
        let Message {
            topic,
            payload,
            qos,
            retain,
        } = message;

        // Holding the client lock keeps registration order equal to queue order.
        let client = self.client.lock().await;
        lock_tracker(&self.tracker).register(completer, qos);

        if let Err(e) = client.publish_bytes(topic, qos.into(), retain, payload).await {
            lock_tracker(&self.tracker).cancel(token_id);
            return Err(PublishError::Rejected(Box::new(e)));
        }

        Ok(token)
    }
}

/// Implementation of Transport trait for MqttClient
#[async_trait]
impl Transport for MqttClient {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        MqttClient::disconnect(self).await
    }

    async fn publish_with_listener(
        &self,
        message: Message,
        listener: Option<Arc<dyn DeliveryObserver>>,
    ) -> Result<DeliveryToken, PublishError> {
        MqttClient::publish_with_listener(self, message, listener).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No DISCONNECT here: the broker sees an unclean drop and publishes the will.
        if let Some(closing_tx) = &self.closing_tx {
            let _ = closing_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

fn lock_tracker(tracker: &StdMutex<DeliveryTracker>) -> MutexGuard<'_, DeliveryTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State owned by the background event-loop task
struct EventLoopTask {
    client_id: String,
    automatic_reconnect: bool,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    closing_rx: watch::Receiver<bool>,
    tracker: Arc<StdMutex<DeliveryTracker>>,
    observer: Arc<dyn DeliveryObserver>,
    handshake: Option<HandshakeSender>,
    connected: bool,
}

impl EventLoopTask {
    async fn run(mut self, mut event_loop: EventLoop) {
        debug!(client_id = %self.client_id, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        let exit_reason = loop {
            let stop = match event_loop.poll().await {
                Ok(event) => {
                    self.process_route(MessageHandler::route_event(&event), &mut reconnect_attempts)
                }
                Err(e) => self.handle_event_loop_error(e, &mut reconnect_attempts).await,
            };
            if let Some(reason) = stop {
                break reason;
            }
        };

        self.fail_pending(&exit_reason);
        debug!(client_id = %self.client_id, reason = %exit_reason, "MQTT event loop stopped");
    }

    /// Returns Some(reason) when the loop should stop
    fn process_route(
        &mut self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
    ) -> Option<String> {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.connected = true;
                *reconnect_attempts = 0;
                debug!(session_present, "CONNACK accepted");
                if let Some(handshake) = self.handshake.take() {
                    let _ = handshake.send(Ok(()));
                }
                None
            }
            EventRoute::ConnectionRefused(reason) => {
                if let Some(handshake) = self.handshake.take() {
                    self.transition(ConnectionEvent::NetworkError(reason.clone()));
                    let _ = handshake.send(Err(ConnectionError::Refused(reason.clone())));
                } else {
                    self.transition(ConnectionEvent::PermanentFailure(reason.clone()));
                }
                Some(format!("Broker refused connection: {reason}"))
            }
            EventRoute::PublishWritten { pkid } => {
                let ready = lock_tracker(&self.tracker).on_publish_written(pkid);
                if let Some(completer) = ready {
                    self.resolve(completer);
                }
                None
            }
            EventRoute::PublishCollided { pkid } => {
                lock_tracker(&self.tracker).on_publish_collided(pkid);
                None
            }
            EventRoute::PublishAcknowledged { pkid, kind } => {
                let ready = lock_tracker(&self.tracker).on_ack(pkid, kind);
                if let Some(completer) = ready {
                    self.resolve(completer);
                }
                None
            }
            EventRoute::DisconnectWritten => {
                self.transition(ConnectionEvent::ClientDisconnected);
                self.connected = false;
                Some("Client disconnected before acknowledgment".to_string())
            }
            EventRoute::BrokerDisconnected => {
                self.report_connection_lost("Broker disconnected");
                // With reconnect on, the following read error moves to Reconnecting.
                if !self.automatic_reconnect {
                    self.transition(ConnectionEvent::DisconnectedByBroker);
                }
                None
            }
            EventRoute::Infrastructure(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                None
            }
        }
    }

    /// Handle event loop error; returns Some(reason) to stop the loop
    async fn handle_event_loop_error(
        &mut self,
        error: rumqttc::ConnectionError,
        reconnect_attempts: &mut u32,
    ) -> Option<String> {
        let reason = error.to_string();

        if let Some(handshake) = self.handshake.take() {
            let failure = match error {
                rumqttc::ConnectionError::ConnectionRefused(code) => {
                    ConnectionError::Refused(MessageHandler::describe_refusal(code))
                }
                other => ConnectionError::Failed(other.to_string()),
            };
            self.transition(ConnectionEvent::NetworkError(reason.clone()));
            let _ = handshake.send(Err(failure));
            return Some(reason);
        }

        self.report_connection_lost(&reason);

        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect,
            self.automatic_reconnect,
            *self.closing_rx.borrow(),
        );
        self.transition(HealthMonitor::event_after_error(
            &decision,
            &reason,
            self.reconnect.max_attempts,
        ));

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                lock_tracker(&self.tracker).mark_for_resend();

                let max_display = self
                    .reconnect
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !interruptible_sleep(self.closing_rx.clone(), delay_ms).await {
                    return Some("Client disconnected during reconnection".to_string());
                }
                None
            }
            ReconnectionDecision::AbortShutdownRequested => {
                Some("Client disconnected during reconnection".to_string())
            }
            ReconnectionDecision::AbortDisabled => Some(reason),
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let max_attempts = self.reconnect.max_attempts.unwrap_or_default();
                Some(format!("Max reconnection attempts ({max_attempts}) exceeded"))
            }
        }
    }

    fn report_connection_lost(&mut self, cause: &str) {
        if self.connected {
            self.connected = false;
            self.observer.connection_lost(Some(cause));
        }
    }

    fn resolve(&self, completer: TokenCompleter) {
        let message_id = completer.message_id();
        completer.complete();
        self.observer.delivery_complete(message_id);
    }

    fn fail_pending(&self, reason: &str) {
        let pending = lock_tracker(&self.tracker).drain();
        if !pending.is_empty() {
            warn!(count = pending.len(), reason, "Failing undelivered messages");
        }
        for completer in pending {
            completer.fail(reason);
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }
}

/// Perform interruptible sleep with closing monitoring
/// Returns true if sleep completed, false if the client is closing
async fn interruptible_sleep(mut closing_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *closing_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = closing_rx.changed() => {
            if changed.is_err() || *closing_rx.borrow() {
                info!("Client closing during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use crate::transport::QosLevel;

    fn test_config(broker_url: &str, persist_dir: &std::path::Path) -> ConnectionConfig {
        ConnectionConfig::builder(broker_url, "client-unit-test")
            .persist_dir(persist_dir)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn test_client(broker_url: &str, persist_dir: &std::path::Path) -> MqttClient {
        MqttClient::new(test_config(broker_url, persist_dir), Arc::new(NoopObserver))
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (closing_tx, closing_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*closing_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        closing_tx.send(true).unwrap();
        assert!(*closing_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_handshake_success() {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(Ok(()));
        });

        let result = MqttClient::wait_for_handshake(rx, Duration::from_millis(500)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_handshake_timeout() {
        let (_tx, rx) = oneshot::channel();

        let result = MqttClient::wait_for_handshake(rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_handshake_refused() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(ConnectionError::Refused("not authorized".into())))
            .unwrap();

        let result = MqttClient::wait_for_handshake(rx, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ConnectionError::Refused(_))));
    }

    #[tokio::test]
    async fn test_wait_for_handshake_task_gone() {
        let (tx, rx) = oneshot::channel::<Result<(), ConnectionError>>();
        drop(tx);

        let result = MqttClient::wait_for_handshake(rx, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ConnectionError::Failed(_))));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let ((_, _), (_closing_tx, closing_rx)) = MqttClient::setup_connection_channels();
        assert!(interruptible_sleep(closing_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let ((_, _), (closing_tx, closing_rx)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = closing_tx.send(true);
        });

        assert!(!interruptible_sleep(closing_rx, 1000).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_already_closing() {
        let ((_, _), (closing_tx, closing_rx)) = MqttClient::setup_connection_channels();
        closing_tx.send(true).unwrap();
        assert!(!interruptible_sleep(closing_rx, 1000).await);
    }

    #[tokio::test]
    async fn test_connection_state_before_connect() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client("tcp://localhost:1883", dir.path());

        assert!(client.connection_state().is_none());
        assert!(!Transport::is_connected(&client));
        assert_eq!(client.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client("tcp://localhost:1883", dir.path());

        let message = Message::new("TestTopic", "Sending message 0", QosLevel::ExactlyOnce, true);
        let result = client.publish_with_listener(message, None).await;

        assert!(matches!(result, Err(PublishError::NotConnected { .. })));
        assert_eq!(client.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client("tcp://localhost:1883", dir.path());

        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_fails_when_persist_dir_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut client = test_client("tcp://localhost:1883", file.path());

        let result = client.connect().await;

        assert!(matches!(result, Err(ConnectionError::Persistence { .. })));
        assert!(client.connection_state().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(&format!("tcp://127.0.0.1:{port}"), dir.path());

        let result = client.connect().await;

        assert!(
            matches!(result, Err(ConnectionError::Failed(_))),
            "unexpected result: {result:?}"
        );
        assert!(matches!(
            client.connection_state(),
            Some(ConnectionState::Disconnected(_))
        ));
        assert!(client.disconnect().await.is_ok());
    }
}
