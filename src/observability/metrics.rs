//! Delivery counters
//!
//! [`DeliveryStats`] is an observer that counts outcomes with atomics, so it
//! can be shared between the session observer and every per-token listener
//! of a run without locking.

use crate::observer::DeliveryObserver;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters fed by observer callbacks
#[derive(Debug)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    connections_lost: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub connections_lost: u64,
    pub elapsed_ms: u64,
    pub delivered_per_sec: f64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn connections_lost(&self) -> u64 {
        self.connections_lost.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed();
        let delivered = self.delivered();
        let delivered_per_sec = if elapsed.as_secs_f64() > 0.0 {
            delivered as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        StatsSnapshot {
            delivered,
            failed: self.failed(),
            connections_lost: self.connections_lost(),
            elapsed_ms: elapsed.as_millis() as u64,
            delivered_per_sec,
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts token outcomes and connection losses.
///
/// `delivery_complete` is not counted: the per-token `on_success` covers the
/// same event, and the stats object usually sees both.
impl DeliveryObserver for DeliveryStats {
    fn connection_lost(&self, _cause: Option<&str>) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    fn on_success(&self, _message_id: Option<u16>) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failure(&self, _message_id: Option<u16>, _reason: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}
