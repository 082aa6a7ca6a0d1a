//! Delivery observers
//!
//! Observers are called from the transport's background task, never from the
//! publish loop. Every method has an empty default so an observer only
//! implements the callbacks it cares about. Implementations must not block.
//!
//! Two roles use the same trait:
//!
//! - the *session observer*, registered once per client, receives
//!   `connection_lost` and `delivery_complete`;
//! - a *per-token listener*, passed with a single publish, receives
//!   `on_success` or `on_failure` when that token resolves.

use crate::error::display_message_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callbacks for connection and delivery events
pub trait DeliveryObserver: Send + Sync {
    /// The connection to the broker dropped. `cause` is empty when unknown.
    fn connection_lost(&self, _cause: Option<&str>) {}

    /// A message was fully acknowledged. QoS 0 messages carry no packet id.
    fn delivery_complete(&self, _message_id: Option<u16>) {}

    /// The token this listener was attached to resolved successfully
    fn on_success(&self, _message_id: Option<u16>) {}

    /// The token this listener was attached to failed
    fn on_failure(&self, _message_id: Option<u16>, _reason: &str) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DeliveryObserver for NoopObserver {}

/// Logs every callback through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl DeliveryObserver for LoggingObserver {
    fn connection_lost(&self, cause: Option<&str>) {
        match cause.filter(|c| !c.is_empty()) {
            Some(cause) => warn!(cause, "Connection lost"),
            None => warn!("Connection lost"),
        }
    }

    fn delivery_complete(&self, message_id: Option<u16>) {
        debug!(
            message_id = display_message_id(&message_id),
            "Delivery complete for token"
        );
    }

    fn on_success(&self, message_id: Option<u16>) {
        debug!(
            message_id = display_message_id(&message_id),
            "Listener success for token"
        );
    }

    fn on_failure(&self, message_id: Option<u16>, reason: &str) {
        warn!(
            message_id = display_message_id(&message_id),
            reason, "Listener failure for token"
        );
    }
}

/// Per-publish action listener with a completion flag
///
/// Logs like [`LoggingObserver`] and flips `is_done()` once its token
/// resolved either way.
#[derive(Debug, Default)]
pub struct DeliveryListener {
    done: AtomicBool,
    succeeded: AtomicBool,
}

impl DeliveryListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// True once the token resolved successfully
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }
}

impl DeliveryObserver for DeliveryListener {
    fn on_success(&self, message_id: Option<u16>) {
        LoggingObserver.on_success(message_id);
        self.succeeded.store(true, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    fn on_failure(&self, message_id: Option<u16>, reason: &str) {
        LoggingObserver.on_failure(message_id, reason);
        self.done.store(true, Ordering::Release);
    }
}

/// Fans every callback out to a list of observers, in order
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn DeliveryObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn DeliveryObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn DeliveryObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl DeliveryObserver for CompositeObserver {
    fn connection_lost(&self, cause: Option<&str>) {
        for observer in &self.observers {
            observer.connection_lost(cause);
        }
    }

    fn delivery_complete(&self, message_id: Option<u16>) {
        for observer in &self.observers {
            observer.delivery_complete(message_id);
        }
    }

    fn on_success(&self, message_id: Option<u16>) {
        for observer in &self.observers {
            observer.on_success(message_id);
        }
    }

    fn on_failure(&self, message_id: Option<u16>, reason: &str) {
        for observer in &self.observers {
            observer.on_failure(message_id, reason);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        lost: AtomicUsize,
        complete: AtomicUsize,
        success: AtomicUsize,
        failure: AtomicUsize,
    }

    impl DeliveryObserver for Recorder {
        fn connection_lost(&self, _cause: Option<&str>) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
        fn delivery_complete(&self, _message_id: Option<u16>) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }
        fn on_success(&self, _message_id: Option<u16>) {
            self.success.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failure(&self, _message_id: Option<u16>, _reason: &str) {
            self.failure.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delivery_listener_done_after_success() {
        let listener = DeliveryListener::new();
        assert!(!listener.is_done());

        listener.on_success(Some(7));

        assert!(listener.is_done());
        assert!(listener.succeeded());
    }

    #[test]
    fn test_delivery_listener_done_after_failure() {
        let listener = DeliveryListener::new();

        listener.on_failure(None, "connection lost");

        assert!(listener.is_done());
        assert!(!listener.succeeded());
    }

    #[test]
    fn test_delivery_listener_ignores_session_callbacks() {
        let listener = DeliveryListener::new();

        listener.connection_lost(Some("io error"));
        listener.delivery_complete(Some(1));

        assert!(!listener.is_done());
    }

    #[test]
    fn test_composite_fans_out_to_every_observer() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let observers: Vec<Arc<dyn DeliveryObserver>> = vec![first.clone(), second.clone()];
        let composite = CompositeObserver::new(observers);

        composite.connection_lost(None);
        composite.delivery_complete(Some(3));
        composite.on_success(Some(3));
        composite.on_failure(Some(4), "nope");

        for recorder in [&first, &second] {
            assert_eq!(recorder.lost.load(Ordering::SeqCst), 1);
            assert_eq!(recorder.complete.load(Ordering::SeqCst), 1);
            assert_eq!(recorder.success.load(Ordering::SeqCst), 1);
            assert_eq!(recorder.failure.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_composite_push_and_len() {
        let mut composite = CompositeObserver::default();
        assert!(composite.is_empty());

        composite.push(Arc::new(LoggingObserver));
        composite.push(Arc::new(NoopObserver));

        assert_eq!(composite.len(), 2);
    }
}
