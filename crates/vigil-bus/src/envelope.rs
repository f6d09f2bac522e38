//! Message envelope wire format.
//!
//! The serde shape is the stable wire format: envelopes cross process and
//! transport boundaries as flat snake_case JSON and are read back by the
//! receive loops. Change it only additively.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Delivery priority. High and Critical jump the low-latency queue;
/// the durable transport offers no priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background traffic
    Low,
    /// Default
    Medium,
    /// Jumps the fast-transport queue
    High,
    /// Jumps the fast-transport queue
    Critical,
}

impl Priority {
    /// Whether this priority is pushed to the head of the fast queue.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        *self >= Priority::High
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// A message in flight between two named agents.
///
/// Created on enqueue, mutated only by incrementing `retry_count`,
/// destroyed on successful delivery, expiry, or DLQ hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,
    /// Sending agent name
    pub sender: String,
    /// Receiving agent name
    pub recipient: String,
    /// Message type tag (e.g. "incident_summary")
    pub message_type: String,
    /// Free-form payload
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Delivery priority
    #[serde(default)]
    pub priority: Priority,
    /// When the envelope was created
    pub created_at: DateTime<Utc>,
    /// Hard expiry; never delivered past this instant
    pub expires_at: DateTime<Utc>,
    /// Delivery attempts consumed so far
    #[serde(default)]
    pub retry_count: u32,
    /// Delivery attempts allowed before dead-lettering
    pub max_retries: u32,
    /// Correlation ID linking related messages
    pub correlation_id: Option<Uuid>,
}

impl MessageEnvelope {
    /// Create an envelope with the given TTL and retry budget.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
        ttl: std::time::Duration,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            payload,
            priority: Priority::Medium,
            created_at: now,
            expires_at: now + Duration::from_std(ttl).unwrap_or(Duration::seconds(300)),
            retry_count: 0,
            max_retries,
            correlation_id: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Whether the envelope has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Consume one delivery attempt.
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Whether the retry budget is spent.
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Remaining TTL, zero if already expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> std::time::Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
