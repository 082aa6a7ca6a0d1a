//! Delivery tokens
//!
//! A [`DeliveryToken`] is handed back for every submitted message and
//! resolves exactly once, when the transport learns the message's outcome.
//! The transport keeps the matching [`TokenCompleter`]. Dropping the
//! completer without resolving it makes waiters fail with
//! [`PublishError::OutcomeLost`].

use crate::error::PublishError;
use crate::observer::DeliveryObserver;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Observable status of a single delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered {
        message_id: Option<u16>,
    },
    Failed {
        message_id: Option<u16>,
        reason: String,
    },
}

impl DeliveryStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// Create a linked completer/token pair
///
/// `listener` receives `on_success` or `on_failure` when the completer
/// resolves, before any waiter on the token wakes up.
pub fn delivery_token(
    id: u64,
    listener: Option<Arc<dyn DeliveryObserver>>,
) -> (TokenCompleter, DeliveryToken) {
    let (status_tx, status_rx) = watch::channel(DeliveryStatus::Pending);
    (
        TokenCompleter {
            id,
            message_id: None,
            status: status_tx,
            listener,
        },
        DeliveryToken {
            id,
            status: status_rx,
        },
    )
}

/// Handle for observing the outcome of one publish
#[derive(Debug, Clone)]
pub struct DeliveryToken {
    id: u64,
    status: watch::Receiver<DeliveryStatus>,
}

impl DeliveryToken {
    /// A token that is already resolved successfully
    pub fn completed(id: u64, message_id: Option<u16>) -> Self {
        let (completer, token) = delivery_token(id, None);
        completer.complete_with(message_id);
        token
    }

    /// Local sequence number, unique per client
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Packet identifier, once the outcome is known
    pub fn message_id(&self) -> Option<u16> {
        match &*self.status.borrow() {
            DeliveryStatus::Pending => None,
            DeliveryStatus::Delivered { message_id } => *message_id,
            DeliveryStatus::Failed { message_id, .. } => *message_id,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.status.borrow().is_resolved()
    }

    /// Wait until the delivery resolves
    ///
    /// Returns the packet identifier on success (`None` for QoS 0).
    pub async fn wait(&mut self) -> Result<Option<u16>, PublishError> {
        loop {
            match &*self.status.borrow_and_update() {
                DeliveryStatus::Pending => {}
                DeliveryStatus::Delivered { message_id } => return Ok(*message_id),
                DeliveryStatus::Failed { message_id, reason } => {
                    return Err(PublishError::Failed {
                        message_id: *message_id,
                        reason: reason.clone(),
                    })
                }
            }

            if self.status.changed().await.is_err() {
                // Sender gone; a final value may still have been written.
                return match &*self.status.borrow() {
                    DeliveryStatus::Delivered { message_id } => Ok(*message_id),
                    DeliveryStatus::Failed { message_id, reason } => Err(PublishError::Failed {
                        message_id: *message_id,
                        reason: reason.clone(),
                    }),
                    DeliveryStatus::Pending => Err(PublishError::OutcomeLost),
                };
            }
        }
    }
}

/// Transport-side half of a delivery token
pub struct TokenCompleter {
    id: u64,
    message_id: Option<u16>,
    status: watch::Sender<DeliveryStatus>,
    listener: Option<Arc<dyn DeliveryObserver>>,
}

impl TokenCompleter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message_id(&self) -> Option<u16> {
        self.message_id
    }

    /// Record the packet identifier the message went out with
    pub fn assign_message_id(&mut self, message_id: u16) {
        self.message_id = Some(message_id);
    }

    /// Resolve successfully with the assigned packet identifier
    pub fn complete(self) {
        let message_id = self.message_id;
        self.complete_with(message_id);
    }

    fn complete_with(self, message_id: Option<u16>) {
        if let Some(listener) = &self.listener {
            listener.on_success(message_id);
        }
        let _ = self.status.send(DeliveryStatus::Delivered { message_id });
    }

    /// Resolve as failed
    pub fn fail(self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(listener) = &self.listener {
            listener.on_failure(self.message_id, &reason);
        }
        let _ = self.status.send(DeliveryStatus::Failed {
            message_id: self.message_id,
            reason,
        });
    }
}

impl fmt::Debug for TokenCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCompleter")
            .field("id", &self.id)
            .field("message_id", &self.message_id)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
