//! The publish loop
//!
//! Drives a [`Transport`] through one run: connect, submit a bounded number
//! of messages at a fixed interval, then disconnect.
//!
//! ```text
//! Connecting ──ok──▶ Publishing ──count reached──▶ Disconnecting ──ok──▶ Done
//!      │                 │                              │
//!      └──────err────────┴─────────────err──────────────┴──────▶ Failed
//! ```

use crate::error::{PublishError, PublisherError};
use crate::observer::DeliveryObserver;
use crate::token::{DeliveryStatus, DeliveryToken};
use crate::transport::{Message, QosLevel, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// How the loop treats delivery tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPolicy {
    /// Wait for each token before the next submission
    #[default]
    #[serde(alias = "sync")]
    Synchronous,
    /// Submit and move on; tokens are only looked at when draining
    #[serde(alias = "async")]
    FireAndForget,
}

impl FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Ok(DeliveryPolicy::Synchronous),
            "async" | "fire-and-forget" => Ok(DeliveryPolicy::FireAndForget),
            other => Err(format!(
                "unknown delivery policy '{other}' (expected sync or async)"
            )),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::Synchronous => write!(f, "sync"),
            DeliveryPolicy::FireAndForget => write!(f, "async"),
        }
    }
}

/// Publish loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LoopState {
    #[default]
    Connecting,
    Publishing,
    Disconnecting,
    Done,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Connecting => "connecting",
            LoopState::Publishing => "publishing",
            LoopState::Disconnecting => "disconnecting",
            LoopState::Done => "done",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one run needs to know about what to send
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub topic: String,
    pub count: u64,
    pub interval: Duration,
    pub qos: QosLevel,
    pub retain: bool,
    pub policy: DeliveryPolicy,
    pub drain_before_disconnect: bool,
    pub drain_timeout: Duration,
    /// Log progress at info every this many messages; 0 disables it
    pub progress_every: u64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            topic: "TestTopic".to_string(),
            count: 100_000,
            interval: Duration::from_millis(100),
            qos: QosLevel::ExactlyOnce,
            retain: true,
            policy: DeliveryPolicy::Synchronous,
            drain_before_disconnect: true,
            drain_timeout: Duration::from_secs(10),
            progress_every: 1000,
        }
    }
}

impl PublishSettings {
    /// Build message `index` (0-based) of the run
    pub fn message(&self, index: u64) -> Message {
        Message::new(
            self.topic.clone(),
            format!("Sending message {index}"),
            self.qos,
            self.retain,
        )
    }
}

/// Outcome counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Messages the transport accepted
    pub submitted: u64,
    /// Tokens that resolved successfully
    pub confirmed: u64,
    /// Tokens that resolved as failures
    pub failed: u64,
    /// Tokens still pending when the run ended
    pub abandoned: u64,
    pub final_state: LoopState,
}

/// Sequential driver for one publishing run
pub struct PublishLoop<T: Transport> {
    transport: T,
    settings: PublishSettings,
    listener: Option<Arc<dyn DeliveryObserver>>,
    state: LoopState,
    report: RunReport,
}

impl<T: Transport> PublishLoop<T> {
    pub fn new(transport: T, settings: PublishSettings) -> Self {
        Self {
            transport,
            settings,
            listener: None,
            state: LoopState::Connecting,
            report: RunReport::default(),
        }
    }

    /// Attach a listener to every token of the run
    pub fn with_listener(mut self, listener: Arc<dyn DeliveryObserver>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run connect, publish and disconnect to completion
    pub async fn run(&mut self) -> Result<RunReport, PublisherError> {
        let span = crate::publish_span!(
            topic = %self.settings.topic,
            count = self.settings.count,
            qos = %self.settings.qos,
            policy = %self.settings.policy
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<RunReport, PublisherError> {
        self.report = RunReport::default();
        self.transition(LoopState::Connecting);

        if let Err(e) = self.transport.connect().await {
            error!("Connection failed: {}", e);
            self.transition(LoopState::Failed);
            return Err(e.into());
        }

        self.transition(LoopState::Publishing);
        let mut outstanding = Vec::new();
        let published = self.publish_all(&mut outstanding).await;

        if !outstanding.is_empty() {
            if published.is_ok() && self.settings.drain_before_disconnect {
                self.drain(&mut outstanding).await;
            }
            self.tally(&outstanding);
        }

        self.transition(LoopState::Disconnecting);
        let disconnected = self.transport.disconnect().await;

        let result = match (published, disconnected) {
            (Err(e), disconnected) => {
                if let Err(disconnect_error) = disconnected {
                    warn!("Disconnect after failed run also failed: {}", disconnect_error);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => {
                error!("Disconnect failed: {}", e);
                Err(e.into())
            }
            (Ok(()), Ok(())) => Ok(()),
        };

        match result {
            Ok(()) => {
                self.transition(LoopState::Done);
                info!(
                    submitted = self.report.submitted,
                    confirmed = self.report.confirmed,
                    failed = self.report.failed,
                    abandoned = self.report.abandoned,
                    "Publishing run finished"
                );
                Ok(self.report.clone())
            }
            Err(e) => {
                self.transition(LoopState::Failed);
                Err(e)
            }
        }
    }

    async fn publish_all(
        &mut self,
        outstanding: &mut Vec<DeliveryToken>,
    ) -> Result<(), PublisherError> {
        for index in 0..self.settings.count {
            if index > 0 && !self.settings.interval.is_zero() {
                tokio::time::sleep(self.settings.interval).await;
            }

            let message = self.settings.message(index);
            debug!(index, "Publishing message");

            let mut token = self
                .transport
                .publish_with_listener(message, self.listener.clone())
                .await
                .map_err(|e| {
                    error!(index, "Publish failed: {}", e);
                    e
                })?;
            self.report.submitted += 1;

            match self.settings.policy {
                DeliveryPolicy::Synchronous => self.await_delivery(index, &mut token).await?,
                DeliveryPolicy::FireAndForget => outstanding.push(token),
            }

            let sent = index + 1;
            if self.settings.progress_every > 0 && sent % self.settings.progress_every == 0 {
                info!(sent, total = self.settings.count, "Publishing progress");
            }
        }
        Ok(())
    }

    async fn await_delivery(
        &mut self,
        index: u64,
        token: &mut DeliveryToken,
    ) -> Result<(), PublishError> {
        match token.wait().await {
            Ok(message_id) => {
                self.report.confirmed += 1;
                debug!(index, ?message_id, "Delivery confirmed");
                Ok(())
            }
            Err(e) => {
                self.report.failed += 1;
                error!(index, "Delivery failed: {}", e);
                Err(e)
            }
        }
    }

    /// Wait for outstanding tokens until they resolve or the drain timeout hits
    async fn drain(&self, outstanding: &mut [DeliveryToken]) {
        let pending = outstanding.iter().filter(|token| !token.is_done()).count();
        if pending == 0 {
            return;
        }
        info!(
            pending,
            timeout = ?self.settings.drain_timeout,
            "Waiting for outstanding deliveries"
        );

        let deadline = Instant::now() + self.settings.drain_timeout;
        for token in outstanding.iter_mut().filter(|token| !token.is_done()) {
            if tokio::time::timeout_at(deadline, token.wait()).await.is_err() {
                warn!("Drain timeout reached with deliveries still pending");
                break;
            }
        }
    }

    fn tally(&mut self, outstanding: &[DeliveryToken]) {
        for token in outstanding {
            match token.status() {
                DeliveryStatus::Delivered { .. } => self.report.confirmed += 1,
                DeliveryStatus::Failed { message_id, reason } => {
                    warn!(?message_id, reason = %reason, "Delivery failed");
                    self.report.failed += 1;
                }
                DeliveryStatus::Pending => self.report.abandoned += 1,
            }
        }
        if self.report.abandoned > 0 {
            warn!(abandoned = self.report.abandoned, "Deliveries abandoned at disconnect");
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Publish loop state change");
        }
        self.state = next;
        self.report.final_state = next;
    }
}
