//! In-memory transport backends.
//!
//! Used for local mode and tests. The durable backend models the external
//! queue service faithfully enough to exercise the bus: named queues with
//! auto-provisioned DLQs, receive counts, a visibility timeout, and a
//! redrive policy.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::transport::{
    dlq_name, DurableTransport, FastTransport, QueuedMessage, TransportError,
};

/// How long a received-but-unacknowledged message stays invisible before it
/// returns to the queue.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a long-poll re-checks the queue.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct FastQueue {
    items: VecDeque<String>,
    expires_at: Instant,
}

/// In-memory low-latency transport: one ordered queue per recipient with a
/// whole-queue TTL.
#[derive(Default)]
pub struct InMemoryFastTransport {
    queues: Mutex<HashMap<String, FastQueue>>,
}

impl InMemoryFastTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastTransport for InMemoryFastTransport {
    async fn push(
        &self,
        queue: &str,
        body: &str,
        urgent: bool,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_string()).or_insert_with(|| FastQueue {
            items: VecDeque::new(),
            expires_at: Instant::now() + ttl,
        });
        if urgent {
            entry.items.push_front(body.to_string());
        } else {
            entry.items.push_back(body.to_string());
        }
        // The queue lives as long as its most recent message's TTL
        entry.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, TransportError> {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(queue) {
            Some(entry) if entry.expires_at <= Instant::now() => {
                debug!(queue = %queue, "Fast queue expired, dropping");
                queues.remove(queue);
                Ok(None)
            }
            Some(entry) => Ok(entry.items.pop_front()),
            None => Ok(None),
        }
    }
}

struct StoredMessage {
    body: String,
    receipt: String,
    receive_count: u32,
}

struct InFlight {
    message: StoredMessage,
    invisible_until: Instant,
}

#[derive(Default)]
struct DurableQueue {
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

/// In-memory durable transport with DLQ redrive.
pub struct InMemoryDurableTransport {
    queues: Mutex<HashMap<String, DurableQueue>>,
    max_receive_count: u32,
    visibility_timeout: Duration,
}

impl InMemoryDurableTransport {
    /// Create a transport that redrives to the DLQ after `max_receive_count`
    /// unacknowledged receives.
    #[must_use]
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_receive_count,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Override the visibility timeout (tests use short values).
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Snapshot the bodies currently sitting in a queue's DLQ.
    pub async fn dlq_messages(&self, queue: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(&dlq_name(queue))
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Total messages waiting in a queue (excluding in-flight).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|q| q.messages.len()).unwrap_or(0)
    }

    /// Return timed-out in-flight messages to the queue, redriving any that
    /// exceeded the receive budget.
    fn requeue_expired(queue: &mut DurableQueue, max_receive: u32) -> Vec<StoredMessage> {
        let now = Instant::now();
        let expired: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, f)| f.invisible_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let mut redriven = Vec::new();
        for receipt in expired {
            if let Some(flight) = queue.in_flight.remove(&receipt) {
                if flight.message.receive_count >= max_receive {
                    redriven.push(flight.message);
                } else {
                    queue.messages.push_back(flight.message);
                }
            }
        }
        redriven
    }
}

#[async_trait]
impl DurableTransport for InMemoryDurableTransport {
    async fn ensure_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        queues.entry(name.to_string()).or_default();
        queues.entry(dlq_name(name)).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_string()).or_default();
        entry.messages.push_back(StoredMessage {
            body: body.to_string(),
            receipt: Uuid::new_v4().to_string(),
            receive_count: 0,
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueuedMessage>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut queues = self.queues.lock().await;
                // Redrive pass happens before every receive
                let redriven = queues
                    .get_mut(queue)
                    .map(|q| Self::requeue_expired(q, self.max_receive_count))
                    .unwrap_or_default();
                if !redriven.is_empty() {
                    let dlq = queues.entry(dlq_name(queue)).or_default();
                    for message in redriven {
                        debug!(queue = %queue, "Redriving message to DLQ");
                        dlq.messages.push_back(message);
                    }
                }

                if let Some(entry) = queues.get_mut(queue) {
                    if !entry.messages.is_empty() {
                        let mut received = Vec::new();
                        let visibility = self.visibility_timeout;
                        while received.len() < max_messages {
                            let Some(mut message) = entry.messages.pop_front() else {
                                break;
                            };
                            message.receive_count += 1;
                            received.push(QueuedMessage {
                                body: message.body.clone(),
                                receipt: message.receipt.clone(),
                            });
                            entry.in_flight.insert(
                                message.receipt.clone(),
                                InFlight {
                                    message,
                                    invisible_until: Instant::now() + visibility,
                                },
                            );
                        }
                        return Ok(received);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        if let Some(entry) = queues.get_mut(queue) {
            entry.in_flight.remove(receipt);
        }
        Ok(())
    }

    async fn send_to_dlq(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        let dlq = queues.entry(dlq_name(queue)).or_default();
        dlq.messages.push_back(StoredMessage {
            body: body.to_string(),
            receipt: Uuid::new_v4().to_string(),
            receive_count: 0,
        });
        Ok(())
    }
}

impl Default for InMemoryDurableTransport {
    fn default() -> Self {
        Self::new(3)
    }
}
