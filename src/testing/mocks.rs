//! Mock transport for testing
//!
//! Records every call so tests can assert on the exact sequence of
//! connects, publishes, deliveries and disconnects, and injects failures at
//! chosen points. Clones share state, so a test can keep a handle while the
//! publish loop owns the transport.

use crate::error::{ConnectionError, DisconnectError, PublishError};
use crate::observer::DeliveryObserver;
use crate::token::{delivery_token, DeliveryToken, TokenCompleter};
use crate::transport::{mqtt::ConnectionState, Message, QosLevel, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// When the mock resolves delivery tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockDelivery {
    /// Resolve before `publish` returns
    #[default]
    Immediate,
    /// Resolve from a background task after the delay
    Delayed(Duration),
    /// Keep the token pending until [`MockTransport::release_held`]
    Never,
}

/// One recorded interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect,
    Publish {
        index: u64,
        topic: String,
        payload: String,
    },
    Delivered {
        index: u64,
    },
    DeliveryFailed {
        index: u64,
    },
    Disconnect,
}

#[derive(Debug, Clone, Default)]
struct FailurePlan {
    connect: Option<String>,
    /// 1-based index of the publish call to reject
    publish_at: Option<u64>,
    /// 1-based index of the delivery to fail
    delivery_at: Option<u64>,
    disconnect: bool,
}

/// Mock transport for testing
#[derive(Clone, Default)]
pub struct MockTransport {
    delivery: MockDelivery,
    failures: FailurePlan,
    observer: Option<Arc<dyn DeliveryObserver>>,
    events: Arc<Mutex<Vec<MockEvent>>>,
    held: Arc<Mutex<Vec<(u64, TokenCompleter)>>>,
    publish_calls: Arc<AtomicU64>,
    disconnect_calls: Arc<AtomicU64>,
    state: Arc<std::sync::Mutex<Option<ConnectionState>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery(mut self, delivery: MockDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Session observer receiving `delivery_complete`
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn fail_connect(mut self, reason: impl Into<String>) -> Self {
        self.failures.connect = Some(reason.into());
        self
    }

    /// Reject the k-th publish call (1-based)
    pub fn fail_publish_at(mut self, k: u64) -> Self {
        self.failures.publish_at = Some(k);
        self
    }

    /// Fail the delivery token of the k-th publish (1-based)
    pub fn fail_delivery_at(mut self, k: u64) -> Self {
        self.failures.delivery_at = Some(k);
        self
    }

    pub fn fail_disconnect(mut self) -> Self {
        self.failures.disconnect = true;
        self
    }

    pub async fn get_events(&self) -> Vec<MockEvent> {
        self.events.lock().await.clone()
    }

    /// Payloads of every accepted publish, in order
    pub async fn get_published_payloads(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                MockEvent::Publish { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of publish calls, rejected ones included
    pub fn publish_calls(&self) -> u64 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u64 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Resolve every token held back by [`MockDelivery::Never`]
    pub async fn release_held(&self) {
        let held: Vec<_> = self.held.lock().await.drain(..).collect();
        for (index, completer) in held {
            Self::resolve(&self.events, self.observer.as_deref(), index, completer, false).await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Some(state);
    }

    async fn resolve(
        events: &Mutex<Vec<MockEvent>>,
        observer: Option<&dyn DeliveryObserver>,
        index: u64,
        completer: TokenCompleter,
        fail: bool,
    ) {
        if fail {
            events.lock().await.push(MockEvent::DeliveryFailed { index });
            completer.fail("mock delivery failure");
        } else {
            events.lock().await.push(MockEvent::Delivered { index });
            let message_id = completer.message_id();
            completer.complete();
            if let Some(observer) = observer {
                observer.delivery_complete(message_id);
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.events.lock().await.push(MockEvent::Connect);
        if let Some(reason) = &self.failures.connect {
            self.set_state(ConnectionState::Disconnected(reason.clone()));
            return Err(ConnectionError::Refused(reason.clone()));
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().await.push(MockEvent::Disconnect);
        self.set_state(ConnectionState::Disconnected("Client disconnected".to_string()));
        if self.failures.disconnect {
            return Err(DisconnectError::Timeout(Duration::from_secs(2)));
        }
        Ok(())
    }

    async fn publish_with_listener(
        &self,
        message: Message,
        listener: Option<Arc<dyn DeliveryObserver>>,
    ) -> Result<DeliveryToken, PublishError> {
        let index = self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let call = index + 1;

        if !self.is_connected() {
            let state = self
                .connection_state()
                .unwrap_or_else(|| ConnectionState::Disconnected("Never connected".to_string()));
            return Err(PublishError::NotConnected { state });
        }
        if self.failures.publish_at == Some(call) {
            return Err(PublishError::Rejected("mock publish failure".into()));
        }

        self.events.lock().await.push(MockEvent::Publish {
            index,
            topic: message.topic.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        });

        let (mut completer, token) = delivery_token(call, listener);
        if message.qos != QosLevel::AtMostOnce {
            // Packet identifiers are 1..=65535
            completer.assign_message_id((index % u64::from(u16::MAX)) as u16 + 1);
        }
        let fail = self.failures.delivery_at == Some(call);

        match self.delivery {
            MockDelivery::Immediate => {
                Self::resolve(&self.events, self.observer.as_deref(), index, completer, fail).await;
            }
            MockDelivery::Delayed(delay) => {
                let events = self.events.clone();
                let observer = self.observer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::resolve(&events, observer.as_deref(), index, completer, fail).await;
                });
            }
            MockDelivery::Never => self.held.lock().await.push((index, completer)),
        }

        Ok(token)
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
