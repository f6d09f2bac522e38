//! Configuration
//!
//! TOML-backed settings for the consensus weights, the circuit-breaker
//! defaults, and the message-bus retry/TTL policy. Every field has a serde
//! default so a partial file (or none at all) still yields a working config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::consensus::AgentWeights;
use crate::error::{Error, Result};

/// Consensus weight settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSettings {
    /// Weight for detection recommendations
    #[serde(default = "default_detection_weight")]
    pub detection_weight: f64,
    /// Weight for diagnosis recommendations
    #[serde(default = "default_diagnosis_weight")]
    pub diagnosis_weight: f64,
    /// Weight for prediction recommendations
    #[serde(default = "default_prediction_weight")]
    pub prediction_weight: f64,
    /// Weight for resolution recommendations
    #[serde(default = "default_resolution_weight")]
    pub resolution_weight: f64,
    /// Weight for communication recommendations
    #[serde(default = "default_communication_weight")]
    pub communication_weight: f64,
}

fn default_detection_weight() -> f64 {
    0.9
}
fn default_diagnosis_weight() -> f64 {
    1.2
}
fn default_prediction_weight() -> f64 {
    1.0
}
fn default_resolution_weight() -> f64 {
    1.1
}
fn default_communication_weight() -> f64 {
    0.8
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            detection_weight: default_detection_weight(),
            diagnosis_weight: default_diagnosis_weight(),
            prediction_weight: default_prediction_weight(),
            resolution_weight: default_resolution_weight(),
            communication_weight: default_communication_weight(),
        }
    }
}

impl ConsensusSettings {
    /// Convert into the engine's weight table.
    #[must_use]
    pub fn weights(&self) -> AgentWeights {
        AgentWeights {
            detection: self.detection_weight,
            diagnosis: self.diagnosis_weight,
            prediction: self.prediction_weight,
            resolution: self.resolution_weight,
            communication: self.communication_weight,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before opening
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds to wait before probing an open circuit
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_call_timeout_secs() -> u64 {
    10
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl BreakerSettings {
    /// Convert into a [`BreakerConfig`].
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_success_threshold(self.success_threshold)
            .with_reset_timeout(Duration::from_secs(self.reset_timeout_secs))
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }
}

/// Message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Attempts for the resilient send path
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    /// Base delay for send retries in milliseconds
    #[serde(default = "default_send_base_delay_ms")]
    pub send_base_delay_ms: u64,
    /// Default envelope TTL in seconds
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Default per-envelope delivery retries before dead-lettering
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Redis connection URL for the low-latency transport
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_send_attempts() -> u32 {
    3
}
fn default_send_base_delay_ms() -> u64 {
    200
}
fn default_message_ttl_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            send_attempts: default_send_attempts(),
            send_base_delay_ms: default_send_base_delay_ms(),
            message_ttl_secs: default_message_ttl_secs(),
            max_retries: default_max_retries(),
            redis_url: default_redis_url(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Consensus weight table
    #[serde(default)]
    pub consensus: ConsensusSettings,
    /// Circuit breaker defaults
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Message bus policy
    #[serde(default)]
    pub bus: BusSettings,
}

impl VigilConfig {
    /// Load from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&raw)
    }

    /// Parse from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::InvalidConfig {
            field: "config".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot produce a working system.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::InvalidConfig {
                field: "breaker.failure_threshold".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.bus.send_attempts == 0 {
            return Err(Error::InvalidConfig {
                field: "bus.send_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (name, weight) in [
            ("consensus.detection_weight", self.consensus.detection_weight),
            ("consensus.diagnosis_weight", self.consensus.diagnosis_weight),
            ("consensus.prediction_weight", self.consensus.prediction_weight),
            ("consensus.resolution_weight", self.consensus.resolution_weight),
            (
                "consensus.communication_weight",
                self.consensus.communication_weight,
            ),
        ] {
            if weight < 0.0 {
                return Err(Error::InvalidConfig {
                    field: name.to_string(),
                    message: "weight must be non-negative".to_string(),
                });
            }
        }
        Ok(())
    }
}
