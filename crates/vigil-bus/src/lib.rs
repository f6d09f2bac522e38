//! Vigil Bus - Resilient Inter-Agent Messaging
//!
//! Point-to-point delivery between named agents, backed by a low-latency
//! primary transport (Redis lists) and a durable secondary transport with
//! dead-letter queues. The bus owns retry scheduling, expiry filtering, and
//! DLQ routing; every transport call goes through a circuit breaker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod bus;
pub mod envelope;
pub mod memory;
pub mod redis;
pub mod transport;

pub use bus::{BusConfig, BusError, BusStats, MessageBus, MessageHandler, DLQ_NO_HANDLER};
pub use envelope::{MessageEnvelope, Priority};
pub use memory::{InMemoryDurableTransport, InMemoryFastTransport};
pub use redis::RedisTransport;
pub use transport::{dlq_name, DurableTransport, FastTransport, QueuedMessage, TransportError};
