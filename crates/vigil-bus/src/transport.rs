//! Transport trait seams.
//!
//! The bus speaks to two backends through these traits: a low-latency
//! list-based transport and a durable queue service with per-queue
//! dead-letter companions. Concrete bindings live in [`crate::redis`] and
//! [`crate::memory`].

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the backend
    #[error("transport connection error: {0}")]
    Connection(String),

    /// A queue-level operation failed
    #[error("queue '{queue}' error: {message}")]
    Queue {
        /// Queue name
        queue: String,
        /// Detailed message
        message: String,
    },

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A message handed back by the durable transport.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Raw message body
    pub body: String,
    /// Receipt used to acknowledge (delete) the message
    pub receipt: String,
}

/// Dead-letter queue name for a recipient queue.
#[must_use]
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}-dlq")
}

/// Low-latency ordered queue per recipient.
///
/// Urgent pushes go to the head of the queue; the queue as a whole expires
/// with the TTL of the most recent push.
#[async_trait]
pub trait FastTransport: Send + Sync {
    /// Push a message body onto a recipient's queue.
    async fn push(
        &self,
        queue: &str,
        body: &str,
        urgent: bool,
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// Pop the next message without blocking. `None` when empty.
    async fn pop(&self, queue: &str) -> Result<Option<String>, TransportError>;
}

/// Durable at-least-once queue service.
///
/// Each named queue is auto-provisioned together with a dead-letter
/// companion; the redrive policy moves a message to the DLQ once it has been
/// received more than the configured maximum without acknowledgement.
#[async_trait]
pub trait DurableTransport: Send + Sync {
    /// Create the queue and its DLQ if they do not exist. Idempotent.
    async fn ensure_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Enqueue a message body.
    async fn send(&self, queue: &str, body: &str) -> Result<(), TransportError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueuedMessage>, TransportError>;

    /// Acknowledge a received message.
    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), TransportError>;

    /// Write a body straight to the queue's dead-letter companion.
    async fn send_to_dlq(&self, queue: &str, body: &str) -> Result<(), TransportError>;
}
