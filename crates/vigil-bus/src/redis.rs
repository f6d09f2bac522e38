//! Redis-backed low-latency transport.
//!
//! One Redis list per recipient, key-prefixed to isolate from other data.
//! Urgent messages LPUSH to the head, the rest RPUSH to the tail; pops come
//! from the head. The whole list expires with the TTL of the most recent
//! push. Consider enabling Redis AUTH and TLS in production.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::transport::{FastTransport, TransportError};

/// Redis list transport.
pub struct RedisTransport {
    client: redis::Client,
    /// Key prefix for queue keys
    prefix: String,
}

impl RedisTransport {
    /// Create a new Redis transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            prefix: "vigil:queue:".to_string(),
        })
    }

    /// Create with a custom key prefix.
    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self, TransportError> {
        let mut transport = Self::new(redis_url)?;
        transport.prefix = prefix.to_string();
        Ok(transport)
    }

    fn build_key(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl FastTransport for RedisTransport {
    async fn push(
        &self,
        queue: &str,
        body: &str,
        urgent: bool,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(queue);

        let command = if urgent { "LPUSH" } else { "RPUSH" };
        redis::cmd(command)
            .arg(&key)
            .arg(body)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TransportError::Queue {
                queue: queue.to_string(),
                message: format!("Redis {command} failed: {e}"),
            })?;

        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TransportError::Queue {
                queue: queue.to_string(),
                message: format!("Redis EXPIRE failed: {e}"),
            })?;

        debug!(queue = %queue, urgent = urgent, "Pushed message to Redis queue");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, TransportError> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(queue);

        let body: Option<String> = redis::cmd("LPOP")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Queue {
                queue: queue.to_string(),
                message: format!("Redis LPOP failed: {e}"),
            })?;

        Ok(body)
    }
}
