//! Correlation of submitted messages with their acknowledgments
//!
//! `rumqttc` reports outgoing publishes and acknowledgments by packet id but
//! gives no handle per request. Requests leave the request queue in
//! submission order, so the oldest unassigned token always belongs to the
//! next `Outgoing::Publish` or `Outgoing::AwaitAck`.
//!
//! A collision (`AwaitAck`) parks the front token on the busy packet id.
//! `rumqttc` writes the parked publish right before it reports the
//! acknowledgment of the original, so the parked token only goes in flight
//! once that acknowledgment has resolved the original token.
//!
//! Pure bookkeeping: no I/O, no callbacks.

use super::message_handler::AckKind;
use crate::token::TokenCompleter;
use crate::transport::QosLevel;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingDelivery {
    completer: TokenCompleter,
    qos: QosLevel,
    /// PUBREC seen; after a reconnect only the PUBREL is resent
    released: bool,
}

#[derive(Debug)]
struct Collision {
    pkid: u16,
    pending: PendingDelivery,
    written: bool,
}

/// Pending delivery tokens, waiting for a packet id or an acknowledgment
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    unassigned: VecDeque<PendingDelivery>,
    in_flight: HashMap<u16, PendingDelivery>,
    collision: Option<Collision>,
    awaiting_resend: HashSet<u16>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token before its publish request is queued
    pub fn register(&mut self, completer: TokenCompleter, qos: QosLevel) {
        self.unassigned.push_back(PendingDelivery {
            completer,
            qos,
            released: false,
        });
    }

    /// Remove a token whose request never reached the queue
    pub fn cancel(&mut self, token_id: u64) -> Option<TokenCompleter> {
        let position = self
            .unassigned
            .iter()
            .rposition(|pending| pending.completer.id() == token_id)?;
        self.unassigned
            .remove(position)
            .map(|pending| pending.completer)
    }

    /// The connection dropped; unacknowledged publishes will be written again
    /// with their packet ids once the session is back
    pub fn mark_for_resend(&mut self) {
        self.awaiting_resend = self
            .in_flight
            .iter()
            .filter(|(_, pending)| !pending.released)
            .map(|(pkid, _)| *pkid)
            .collect();
    }

    /// The next publish collided with in-flight `pkid` and is held back
    pub fn on_publish_collided(&mut self, pkid: u16) {
        let Some(mut pending) = self.unassigned.pop_front() else {
            warn!(pkid, "Packet id collision without a pending token");
            return;
        };
        if let Some(previous) = self.collision.take() {
            warn!(pkid = previous.pkid, "Replacing unresolved packet id collision");
            self.unassigned.push_front(previous.pending);
        }

        debug!(pkid, "Publish held back on packet id collision");
        pending.completer.assign_message_id(pkid);
        self.collision = Some(Collision {
            pkid,
            pending,
            written: false,
        });
    }

    /// A PUBLISH packet was written with `pkid`
    ///
    /// Returns the completer to resolve now (QoS 0 has nothing to wait for).
    pub fn on_publish_written(&mut self, pkid: u16) -> Option<TokenCompleter> {
        if self.awaiting_resend.remove(&pkid) {
            debug!(pkid, "Retransmitted publish, token already assigned");
            return None;
        }

        if let Some(collision) = self
            .collision
            .as_mut()
            .filter(|collision| collision.pkid == pkid && !collision.written)
        {
            collision.written = true;
            return None;
        }

        if pkid != 0 && self.in_flight.contains_key(&pkid) {
            warn!(pkid, "Publish written for a packet id still in flight");
            return None;
        }

        let Some(mut pending) = self.unassigned.pop_front() else {
            warn!(pkid, "Outgoing publish without a pending token");
            return None;
        };

        if pending.qos == QosLevel::AtMostOnce {
            return Some(pending.completer);
        }

        pending.completer.assign_message_id(pkid);
        self.in_flight.insert(pkid, pending);
        None
    }

    /// An acknowledgment for `pkid` arrived
    ///
    /// PUBACK completes QoS 1, PUBCOMP completes QoS 2. Anything else leaves
    /// the token in flight.
    pub fn on_ack(&mut self, pkid: u16, kind: AckKind) -> Option<TokenCompleter> {
        let pending = self.in_flight.get_mut(&pkid)?;
        if kind == AckKind::PubRec {
            pending.released = true;
        }

        let completes = matches!(
            (pending.qos, kind),
            (QosLevel::AtLeastOnce, AckKind::PubAck) | (QosLevel::ExactlyOnce, AckKind::PubComp)
        );
        if !completes {
            return None;
        }

        let resolved = self.in_flight.remove(&pkid).map(|pending| pending.completer);
        self.awaiting_resend.remove(&pkid);
        self.promote_collision(pkid);
        resolved
    }

    /// The held-back publish takes over `pkid` once the original is acknowledged
    fn promote_collision(&mut self, pkid: u16) {
        let ready = self
            .collision
            .as_ref()
            .is_some_and(|collision| collision.pkid == pkid && collision.written);
        if !ready {
            return;
        }
        if let Some(collision) = self.collision.take() {
            self.in_flight.insert(pkid, collision.pending);
        }
    }

    /// Take every pending token, oldest packet ids first
    pub fn drain(&mut self) -> Vec<TokenCompleter> {
        let mut in_flight: Vec<_> = self.in_flight.drain().collect();
        in_flight.sort_by_key(|(pkid, _)| *pkid);
        self.awaiting_resend.clear();

        in_flight
            .into_iter()
            .map(|(_, pending)| pending.completer)
            .chain(self.collision.take().map(|collision| collision.pending.completer))
            .chain(self.unassigned.drain(..).map(|pending| pending.completer))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.unassigned.len() + self.in_flight.len() + usize::from(self.collision.is_some())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{delivery_token, DeliveryToken};

    fn register(tracker: &mut DeliveryTracker, id: u64, qos: QosLevel) -> DeliveryToken {
        let (completer, token) = delivery_token(id, None);
        tracker.register(completer, qos);
        token
    }

    #[tokio::test]
    async fn test_qos0_resolves_on_write_without_message_id() {
        let mut tracker = DeliveryTracker::new();
        let mut token = register(&mut tracker, 1, QosLevel::AtMostOnce);

        let completer = tracker.on_publish_written(0).expect("QoS 0 completes on write");
        completer.complete();

        assert_eq!(token.wait().await.unwrap(), None);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_qos1_resolves_on_puback() {
        let mut tracker = DeliveryTracker::new();
        let mut token = register(&mut tracker, 1, QosLevel::AtLeastOnce);

        assert!(tracker.on_publish_written(5).is_none());
        assert_eq!(tracker.in_flight(), 1);
        assert!(tracker.on_ack(5, AckKind::PubRec).is_none());

        tracker.on_ack(5, AckKind::PubAck).unwrap().complete();

        assert_eq!(token.wait().await.unwrap(), Some(5));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_qos2_resolves_only_on_pubcomp() {
        let mut tracker = DeliveryTracker::new();
        let mut token = register(&mut tracker, 1, QosLevel::ExactlyOnce);

        tracker.on_publish_written(9);
        assert!(tracker.on_ack(9, AckKind::PubAck).is_none());
        assert!(tracker.on_ack(9, AckKind::PubRec).is_none());
        assert!(!token.is_done());

        tracker.on_ack(9, AckKind::PubComp).unwrap().complete();
        assert_eq!(token.wait().await.unwrap(), Some(9));
    }

    #[test]
    fn test_tokens_assigned_in_submission_order() {
        let mut tracker = DeliveryTracker::new();
        let first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let second = register(&mut tracker, 2, QosLevel::AtLeastOnce);

        tracker.on_publish_written(1);
        tracker.on_publish_written(2);

        tracker.on_ack(2, AckKind::PubAck).unwrap().complete();
        assert!(!first.is_done());
        assert_eq!(second.message_id(), Some(2));

        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();
        assert_eq!(first.message_id(), Some(1));
    }

    #[test]
    fn test_retransmission_does_not_consume_next_token() {
        let mut tracker = DeliveryTracker::new();
        let first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let second = register(&mut tracker, 2, QosLevel::AtLeastOnce);

        tracker.on_publish_written(1);
        tracker.mark_for_resend();
        // Resent after a reconnect
        tracker.on_publish_written(1);
        assert_eq!(tracker.in_flight(), 1);

        tracker.on_publish_written(2);
        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();
        tracker.on_ack(2, AckKind::PubAck).unwrap().complete();

        assert_eq!(first.message_id(), Some(1));
        assert_eq!(second.message_id(), Some(2));
    }

    #[test]
    fn test_collided_publish_keeps_correlation() {
        let mut tracker = DeliveryTracker::new();
        let first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let second = register(&mut tracker, 2, QosLevel::AtLeastOnce);
        let third = register(&mut tracker, 3, QosLevel::AtLeastOnce);

        // Event order produced by rumqttc when the second publish reuses id 1
        assert!(tracker.on_publish_written(1).is_none());
        tracker.on_publish_collided(1);
        assert!(tracker.on_publish_written(1).is_none());
        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();
        assert!(tracker.on_publish_written(2).is_none());
        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();
        tracker.on_ack(2, AckKind::PubAck).unwrap().complete();

        assert_eq!(first.message_id(), Some(1));
        assert_eq!(second.message_id(), Some(1));
        assert_eq!(third.message_id(), Some(2));
        assert!(first.is_done() && second.is_done() && third.is_done());
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_collided_qos2_publish_goes_live_after_pubcomp() {
        let mut tracker = DeliveryTracker::new();
        let first = register(&mut tracker, 1, QosLevel::ExactlyOnce);
        let second = register(&mut tracker, 2, QosLevel::ExactlyOnce);

        tracker.on_publish_written(4);
        tracker.on_publish_collided(4);
        assert!(tracker.on_ack(4, AckKind::PubRec).is_none());
        tracker.on_publish_written(4);
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.pending(), 2);

        tracker.on_ack(4, AckKind::PubComp).unwrap().complete();
        assert!(first.is_done());
        assert!(!second.is_done());

        tracker.on_ack(4, AckKind::PubRec);
        tracker.on_ack(4, AckKind::PubComp).unwrap().complete();
        assert_eq!(second.message_id(), Some(4));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_collision_survives_reconnect() {
        let mut tracker = DeliveryTracker::new();
        let first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let second = register(&mut tracker, 2, QosLevel::AtLeastOnce);

        tracker.on_publish_written(1);
        tracker.on_publish_collided(1);
        tracker.mark_for_resend();

        // The original goes out again, then the held-back publish
        tracker.on_publish_written(1);
        tracker.on_publish_written(1);
        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();
        tracker.on_ack(1, AckKind::PubAck).unwrap().complete();

        assert!(first.is_done());
        assert!(second.is_done());
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_released_qos2_is_not_expected_again_after_reconnect() {
        let mut tracker = DeliveryTracker::new();
        let _released = register(&mut tracker, 1, QosLevel::ExactlyOnce);
        let _queued = register(&mut tracker, 2, QosLevel::ExactlyOnce);

        tracker.on_publish_written(1);
        tracker.on_ack(1, AckKind::PubRec);
        tracker.mark_for_resend();

        // Only PUBREL is resent for id 1, so the next write is a new publish
        tracker.on_ack(1, AckKind::PubComp).unwrap().complete();
        tracker.on_publish_written(1);
        assert_eq!(tracker.in_flight(), 1);
        assert!(tracker.unassigned.is_empty());
    }

    #[tokio::test]
    async fn test_drain_includes_collided_token() {
        let mut tracker = DeliveryTracker::new();
        let _first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let mut second = register(&mut tracker, 2, QosLevel::AtLeastOnce);
        tracker.on_publish_written(1);
        tracker.on_publish_collided(1);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        for completer in drained {
            completer.fail("connection lost");
        }
        assert!(second.wait().await.is_err());
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut tracker = DeliveryTracker::new();
        assert!(tracker.on_ack(42, AckKind::PubAck).is_none());
        assert!(tracker.on_publish_written(3).is_none());
    }

    #[test]
    fn test_cancel_removes_unassigned_token() {
        let mut tracker = DeliveryTracker::new();
        let _first = register(&mut tracker, 1, QosLevel::AtLeastOnce);
        let _second = register(&mut tracker, 2, QosLevel::AtLeastOnce);

        let cancelled = tracker.cancel(2).unwrap();
        assert_eq!(cancelled.id(), 2);
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.cancel(2).is_none());
    }

    #[tokio::test]
    async fn test_drain_returns_every_pending_token() {
        let mut tracker = DeliveryTracker::new();
        let mut in_flight = register(&mut tracker, 1, QosLevel::ExactlyOnce);
        let mut queued = register(&mut tracker, 2, QosLevel::AtLeastOnce);
        tracker.on_publish_written(1);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(tracker.pending(), 0);

        for completer in drained {
            completer.fail("connection lost");
        }
        assert!(matches!(
            in_flight.wait().await,
            Err(crate::error::PublishError::Failed {
                message_id: Some(1),
                ..
            })
        ));
        assert!(queued.wait().await.is_err());
    }
}
