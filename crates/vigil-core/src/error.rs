//! Error types for vigil-core

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::incident::AgentType;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// A pipeline stage failed while invoking its agent
    #[error("stage '{stage}' failed: {message}")]
    Stage {
        /// Stage name as registered in the graph
        stage: String,
        /// Detailed failure message
        message: String,
    },

    /// An agent exceeded its invocation timeout
    #[error("agent {agent} timed out after {timeout_secs}s")]
    AgentTimeout {
        /// Agent type that timed out
        agent: AgentType,
        /// Configured timeout in seconds
        timeout_secs: u64,
    },

    /// Circuit breaker rejected or recorded a failing call
    #[error("circuit breaker: {0}")]
    Breaker(#[from] BreakerError),

    /// Graph wiring problem (unknown node, missing edge target)
    #[error("graph error: {0}")]
    Graph(String),

    /// Invalid configuration
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Internal error (serialization, channel, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a stage error.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
