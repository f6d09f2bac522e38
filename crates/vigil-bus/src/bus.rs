//! The resilient message bus.
//!
//! Send path: low-latency transport first, durable transport on any error,
//! both behind circuit breakers. Receive path: one loop per subscribed
//! agent polling fast-then-durable, with expiry filtering, per-envelope
//! redelivery backoff, and dead-letter hand-off. Shutdown cancels every
//! loop and scheduled redelivery cooperatively and drains the task set.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vigil_core::breaker::{BreakerError, BreakerRegistry};
use vigil_core::config::BusSettings;

use crate::backoff;
use crate::envelope::MessageEnvelope;
use crate::transport::{DurableTransport, FastTransport};

/// DLQ reason recorded when no handler is registered for a recipient.
pub const DLQ_NO_HANDLER: &str = "No message handler";

/// Breaker name guarding the fast transport.
const FAST_BREAKER: &str = "bus:fast";
/// Breaker name guarding the durable transport.
const DURABLE_BREAKER: &str = "bus:durable";

/// Bus errors. Transport details never escape except through these; every
/// transport leg runs under a breaker, so backend failures surface as
/// [`BusError::Breaker`].
#[derive(Debug, Error)]
pub enum BusError {
    /// A circuit breaker rejected or recorded the call
    #[error("breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// Envelope could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The envelope exhausted its send retries and was dead-lettered
    #[error("message {id} dead-lettered after send retries")]
    DeadLettered {
        /// Envelope ID
        id: Uuid,
    },

    /// The bus is shutting down and accepts no new work
    #[error("bus is shutting down")]
    ShuttingDown,
}

/// Handler invoked for each delivered envelope.
///
/// Errors are strings: the bus only logs them and drives the retry path.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one envelope.
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), String>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), String>> + Send,
{
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), String> {
        (self)(envelope).await
    }
}

/// Bus policy knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Attempts for the resilient send path
    pub send_attempts: u32,
    /// Base delay for send retries
    pub send_base_delay: Duration,
    /// Default envelope TTL
    pub default_ttl: Duration,
    /// Default per-envelope retry budget
    pub default_max_retries: u32,
    /// Durable long-poll wait per receive
    pub receive_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            send_attempts: 3,
            send_base_delay: Duration::from_millis(200),
            default_ttl: Duration::from_secs(300),
            default_max_retries: 3,
            receive_wait: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    /// Build from the shared configuration.
    #[must_use]
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self {
            send_attempts: settings.send_attempts,
            send_base_delay: Duration::from_millis(settings.send_base_delay_ms),
            default_ttl: Duration::from_secs(settings.message_ttl_secs),
            default_max_retries: settings.max_retries,
            receive_wait: Duration::from_secs(1),
        }
    }
}

/// Delivery counters, snapshotted by [`MessageBus::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Envelopes accepted by either transport
    pub sent: u64,
    /// Envelopes sent via the fast transport
    pub fast_sends: u64,
    /// Envelopes that fell back to the durable transport
    pub durable_sends: u64,
    /// Envelopes handled successfully
    pub delivered: u64,
    /// Redeliveries scheduled after handler failures
    pub retried: u64,
    /// Envelopes written to a dead-letter queue
    pub dead_lettered: u64,
    /// Envelopes dropped at expiry
    pub expired: u64,
    /// Currently subscribed agents
    pub subscribers: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    fast_sends: AtomicU64,
    durable_sends: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
}

struct Subscriber {
    // None once the handler is removed; the loop keeps draining and every
    // delivery dead-letters until a handler is registered again.
    handler: Option<Arc<dyn MessageHandler>>,
    token: CancellationToken,
}

/// Dual-backend resilient message bus.
///
/// Construct once at process start and share by `Arc`; there is no global
/// instance.
pub struct MessageBus {
    fast: Arc<dyn FastTransport>,
    durable: Arc<dyn DurableTransport>,
    breakers: Arc<BreakerRegistry>,
    config: BusConfig,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    counters: Counters,
}

impl MessageBus {
    /// Create a bus over the two transports.
    #[must_use]
    pub fn new(
        fast: Arc<dyn FastTransport>,
        durable: Arc<dyn DurableTransport>,
        breakers: Arc<BreakerRegistry>,
        config: BusConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            fast,
            durable,
            breakers,
            config,
            subscribers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            counters: Counters::default(),
        })
    }

    /// Build an envelope with the bus defaults applied.
    #[must_use]
    pub fn envelope(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> MessageEnvelope {
        MessageEnvelope::new(
            sender,
            recipient,
            message_type,
            payload,
            self.config.default_ttl,
            self.config.default_max_retries,
        )
    }

    /// Send one envelope: fast transport first, durable on any error.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<Uuid, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::ShuttingDown);
        }

        let body = serde_json::to_string(envelope)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let urgent = envelope.priority.is_urgent();
        let ttl = envelope.remaining_ttl().max(Duration::from_secs(1));

        let fast_breaker = self.breakers.breaker(FAST_BREAKER);
        let fast_result = fast_breaker
            .call(|| {
                self.fast
                    .push(&envelope.recipient, &body, urgent, ttl)
            })
            .await;

        match fast_result {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.counters.fast_sends.fetch_add(1, Ordering::Relaxed);
                debug!(id = %envelope.id, recipient = %envelope.recipient, "Sent via fast transport");
                Ok(envelope.id)
            }
            Err(fast_err) => {
                warn!(
                    id = %envelope.id,
                    recipient = %envelope.recipient,
                    error = %fast_err,
                    "Fast transport failed, falling back to durable"
                );
                let durable_breaker = self.breakers.breaker(DURABLE_BREAKER);
                durable_breaker
                    .call(|| async {
                        self.durable.ensure_queue(&envelope.recipient).await?;
                        self.durable.send(&envelope.recipient, &body).await
                    })
                    .await?;
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.counters.durable_sends.fetch_add(1, Ordering::Relaxed);
                debug!(id = %envelope.id, recipient = %envelope.recipient, "Sent via durable transport");
                Ok(envelope.id)
            }
        }
    }

    /// Send with retries: up to `send_attempts` tries with exponential
    /// backoff and ±10% jitter, then a direct dead-letter write.
    pub async fn send_with_resilience(
        self: &Arc<Self>,
        envelope: &MessageEnvelope,
    ) -> Result<Uuid, BusError> {
        let mut last_error = None;
        for attempt in 1..=self.config.send_attempts {
            match self.send(envelope).await {
                Ok(id) => return Ok(id),
                Err(BusError::ShuttingDown) => return Err(BusError::ShuttingDown),
                Err(e) => {
                    warn!(
                        id = %envelope.id,
                        attempt = attempt,
                        max_attempts = self.config.send_attempts,
                        error = %e,
                        "Send attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.config.send_attempts {
                        let delay =
                            backoff::send_retry_delay(attempt, self.config.send_base_delay);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.cancel.cancelled() => return Err(BusError::ShuttingDown),
                        }
                    }
                }
            }
        }

        if let Some(e) = last_error {
            error!(id = %envelope.id, error = %e, "Send retries exhausted, dead-lettering");
        }
        self.dead_letter(envelope, "Send retries exhausted").await;
        Err(BusError::DeadLettered { id: envelope.id })
    }

    /// Subscribe an agent. Spawns one receive loop; replaces (and stops) any
    /// previous subscription for the same agent.
    pub async fn subscribe(
        self: &Arc<Self>,
        agent: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::ShuttingDown);
        }
        let agent = agent.into();

        self.breakers
            .breaker(DURABLE_BREAKER)
            .call(|| self.durable.ensure_queue(&agent))
            .await?;

        let token = self.cancel.child_token();
        {
            let mut subscribers = self.subscribers.write().await;
            if let Some(previous) = subscribers.insert(
                agent.clone(),
                Subscriber {
                    handler: Some(handler),
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        let bus = Arc::clone(self);
        let loop_agent = agent.clone();
        self.tracker.spawn(async move {
            bus.receive_loop(loop_agent, token).await;
        });

        info!(agent = %agent, "Agent subscribed");
        Ok(())
    }

    /// Drop an agent's handler while leaving its receive loop running.
    ///
    /// Envelopes that arrive while no handler is registered dead-letter with
    /// reason [`DLQ_NO_HANDLER`] instead of piling up unacknowledged.
    pub async fn remove_handler(&self, agent: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subscriber) = subscribers.get_mut(agent) {
            subscriber.handler = None;
            warn!(agent = %agent, "Handler removed, deliveries will dead-letter");
        }
    }

    /// Remove an agent's subscription and stop its receive loop.
    pub async fn unsubscribe(&self, agent: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subscriber) = subscribers.remove(agent) {
            subscriber.token.cancel();
            info!(agent = %agent, "Agent unsubscribed");
        }
    }

    /// Snapshot the delivery counters.
    pub async fn stats(&self) -> BusStats {
        BusStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            fast_sends: self.counters.fast_sends.load(Ordering::Relaxed),
            durable_sends: self.counters.durable_sends.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            subscribers: self.subscribers.read().await.len(),
        }
    }

    /// Shut the bus down: cancel every receive loop and scheduled
    /// redelivery, then wait for the supervised task set to drain.
    pub async fn shutdown(&self) {
        info!("Message bus shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.subscribers.write().await.clear();
        info!("Message bus shut down");
    }

    /// One agent's receive loop: fast poll, durable long-poll, backoff on
    /// loop-level errors so a broken backend cannot cause an error storm.
    async fn receive_loop(self: Arc<Self>, agent: String, token: CancellationToken) {
        debug!(agent = %agent, "Receive loop starting");
        let mut consecutive_failures: u32 = 0;

        loop {
            if token.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                r = self.receive_once(&agent) => r,
                () = token.cancelled() => break,
            };

            match received {
                Ok(()) => {
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        agent = %agent,
                        failures = consecutive_failures,
                        error = %e,
                        "Receive loop error, backing off"
                    );
                    let delay = backoff::loop_error_delay(consecutive_failures);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => break,
                    }
                }
            }
        }
        debug!(agent = %agent, "Receive loop stopped");
    }

    /// Poll both transports once and dispatch anything found.
    async fn receive_once(self: &Arc<Self>, agent: &str) -> Result<(), BusError> {
        // Fast transport, non-blocking
        let fast_breaker = self.breakers.breaker(FAST_BREAKER);
        match fast_breaker.call(|| self.fast.pop(agent)).await {
            Ok(Some(body)) => {
                self.dispatch(agent, &body).await;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                // Fast transport down is not fatal while durable still works
                debug!(agent = %agent, error = %e, "Fast poll failed, trying durable");
            }
        }

        // Durable transport, long-poll
        let durable_breaker = self.breakers.breaker(DURABLE_BREAKER);
        let messages = durable_breaker
            .call(|| self.durable.receive(agent, 10, self.config.receive_wait))
            .await?;

        for message in messages {
            // At-least-once: the bus owns retries from here, so ack first
            let ack = durable_breaker
                .call(|| self.durable.delete(agent, &message.receipt))
                .await;
            if let Err(e) = ack {
                warn!(agent = %agent, error = %e, "Failed to ack durable message");
            }
            self.dispatch(agent, &message.body).await;
        }
        Ok(())
    }

    /// Decode, expiry-check, and hand one raw message to the handler,
    /// driving the retry/DLQ chain on failure.
    async fn dispatch(self: &Arc<Self>, agent: &str, body: &str) {
        let mut envelope: MessageEnvelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(agent = %agent, error = %e, "Malformed envelope, dead-lettering raw body");
                self.dead_letter_raw(agent, body, "Malformed envelope").await;
                return;
            }
        };

        // Never deliver past expiry, regardless of which transport held it
        if envelope.is_expired() {
            debug!(id = %envelope.id, agent = %agent, "Envelope expired, discarding");
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let handler = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(agent).and_then(|s| s.handler.clone())
        };
        let Some(handler) = handler else {
            warn!(id = %envelope.id, agent = %agent, "No handler registered, dead-lettering");
            self.dead_letter(&envelope, DLQ_NO_HANDLER).await;
            return;
        };

        match handler.handle(envelope.clone()).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(id = %envelope.id, agent = %agent, "Envelope delivered");
            }
            Err(reason) => {
                envelope.increment_retry();
                if envelope.retries_exhausted() {
                    warn!(
                        id = %envelope.id,
                        agent = %agent,
                        retries = envelope.retry_count,
                        reason = %reason,
                        "Retry budget exhausted, dead-lettering"
                    );
                    self.dead_letter(&envelope, "Retry limit exceeded").await;
                } else {
                    self.schedule_redelivery(envelope, reason);
                }
            }
        }
    }

    /// Schedule a delayed redelivery as a supervised task.
    fn schedule_redelivery(self: &Arc<Self>, envelope: MessageEnvelope, reason: String) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let delay = backoff::redelivery_delay(envelope.retry_count);
        warn!(
            id = %envelope.id,
            retry = envelope.retry_count,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Scheduling redelivery"
        );

        let bus = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = bus.send(&envelope).await {
                        error!(id = %envelope.id, error = %e, "Redelivery send failed, dead-lettering");
                        bus.dead_letter(&envelope, "Redelivery failed").await;
                    }
                }
                () = bus.cancel.cancelled() => {
                    debug!(id = %envelope.id, "Redelivery cancelled by shutdown");
                }
            }
        });
    }

    /// Write an envelope plus DLQ metadata to the recipient's dead-letter
    /// queue.
    async fn dead_letter(&self, envelope: &MessageEnvelope, reason: &str) {
        let body = match serde_json::to_value(envelope) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.insert("dlq_reason".to_string(), serde_json::json!(reason));
                map.insert(
                    "dlq_timestamp".to_string(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
                serde_json::Value::Object(map).to_string()
            }
            _ => {
                error!(id = %envelope.id, "Envelope did not serialize to an object");
                return;
            }
        };
        self.dead_letter_raw(&envelope.recipient, &body, reason).await;
    }

    async fn dead_letter_raw(&self, queue: &str, body: &str, reason: &str) {
        let breaker = self.breakers.breaker(DURABLE_BREAKER);
        let result = breaker
            .call(|| async {
                self.durable.ensure_queue(queue).await?;
                self.durable.send_to_dlq(queue, body).await
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                info!(queue = %queue, reason = %reason, "Message dead-lettered");
            }
            Err(e) => {
                // Last resort: the message is lost to the DLQ but not to the logs
                error!(queue = %queue, reason = %reason, error = %e, "Dead-letter write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests;
