//! Vigil Core - Incident Orchestration Engine
//!
//! This crate provides the coordination substrate for the Vigil multi-agent
//! incident responder, including:
//! - Incident: The shared incident/recommendation data model
//! - Graph: A small DAG executor that threads state through pipeline stages
//! - Consensus: Weighted arbitration between competing agent recommendations
//! - Breaker: Circuit breakers protecting every unreliable downstream call
//! - Agents: The agent trait seam plus minimal built-in heuristics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agents;
pub mod breaker;
pub mod config;
pub mod consensus;
pub mod error;
pub mod graph;
pub mod incident;

pub use agents::{
    CommunicationAgent, DetectionAgent, DiagnosisAgent, IncidentAgent, PredictionAgent,
    ResolutionAgent,
};
pub use breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState,
    DependencyHealth, HealthReport,
};
pub use config::{BreakerSettings, BusSettings, ConsensusSettings, VigilConfig};
pub use consensus::{AgentWeights, ConsensusDecision, ConsensusEngine, WEIGHTED_FALLBACK};
pub use error::{Error, Result};
pub use graph::{
    standard_pipeline, CommunicationSummary, GraphRunOutcome, GraphState, IncidentGraph,
    PipelineAgents, StageNode, StageUpdate, SummaryPublisher, TimelineEvent, END_NODE, START_NODE,
};
pub use incident::{
    ActionType, AgentType, Incident, IncidentStatus, Recommendation, RiskLevel, Severity,
};
