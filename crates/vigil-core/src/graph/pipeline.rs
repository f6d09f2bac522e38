//! Standard pipeline wiring and stage adapters.
//!
//! Adapters invoke one agent each through the circuit-breaker registry,
//! normalize the output into the shared state shape, and record one
//! timeline event per phase. The communication stage is the canonical
//! best-effort node: a publish failure is logged, never fatal.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agents::{IncidentAgent, CONSENSUS_ACTION_KEY};
use crate::breaker::BreakerRegistry;
use crate::consensus::ConsensusEngine;
use crate::error::{Error, Result};
use crate::incident::{AgentType, Incident, IncidentStatus, Recommendation};

use super::executor::{IncidentGraph, StageNode, END_NODE, START_NODE};
use super::state::{GraphState, StageUpdate, TimelineEvent};

/// Outcome of the communication stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationSummary {
    /// Stakeholders the summary was addressed to
    pub recipients: Vec<String>,
    /// Rendered summary text
    pub message: String,
    /// Whether the bus hand-off succeeded
    pub published: bool,
}

/// Hand-off seam for publishing the communication summary.
///
/// The binary wires this to the message bus; tests inject fakes. The core
/// only guarantees it attempts the hand-off and logs failure.
#[async_trait]
pub trait SummaryPublisher: Send + Sync {
    /// Publish the incident summary. Errors are strings on purpose: the
    /// caller only logs them.
    async fn publish_summary(
        &self,
        incident: &Incident,
        summary: &CommunicationSummary,
    ) -> std::result::Result<(), String>;
}

/// Generic stage adapter: one agent, one breaker, one timeline event.
pub struct StageAdapter {
    agent: Arc<dyn IncidentAgent>,
    registry: Arc<BreakerRegistry>,
}

impl StageAdapter {
    /// Wrap an agent with breaker protection.
    #[must_use]
    pub fn new(agent: Arc<dyn IncidentAgent>, registry: Arc<BreakerRegistry>) -> Self {
        Self { agent, registry }
    }

    fn phase(&self) -> AgentType {
        self.agent.agent_type()
    }

    /// Invoke the agent through its named breaker.
    async fn invoke(&self, state: &GraphState) -> Result<Vec<Recommendation>> {
        let phase = self.phase();
        let breaker = self.registry.breaker(&format!("agent:{phase}"));
        let recs = breaker
            .call(|| self.agent.process(&state.incident, &state.context))
            .await?;
        debug!(phase = %phase, count = recs.len(), "Agent produced recommendations");
        Ok(recs)
    }

    /// Timeline event plus completion marker shared by every stage.
    fn base_update(&self, phase: AgentType, message: String) -> StageUpdate {
        StageUpdate::new()
            .with_event(TimelineEvent::new(phase.to_string(), phase, message))
            .with_context(
                format!("{phase}_completed_at"),
                serde_json::json!(Utc::now().to_rfc3339()),
            )
    }
}

#[async_trait]
impl StageNode for StageAdapter {
    async fn run(&self, state: &GraphState) -> Result<StageUpdate> {
        let phase = self.phase();
        let recs = self.invoke(state).await?;
        let message = format!("{} produced {} recommendation(s)", phase, recs.len());
        let mut update = self.base_update(phase, message);

        match phase {
            AgentType::Detection => {
                update.status = Some(IncidentStatus::Diagnosing);
                update.detection = Some(recs);
            }
            AgentType::Diagnosis => update.diagnosis = Some(recs),
            AgentType::Prediction => update.prediction = Some(recs),
            other => {
                return Err(Error::stage(
                    other.to_string(),
                    "StageAdapter only serves detection/diagnosis/prediction",
                ))
            }
        }
        Ok(update)
    }
}

/// Analysis fan-out: diagnosis and prediction run concurrently.
///
/// Structured join: both must complete; their partial updates merge
/// left-to-right, diagnosis first.
pub struct AnalysisNode {
    diagnosis: StageAdapter,
    prediction: StageAdapter,
}

impl AnalysisNode {
    /// Build the composite from the two analysis agents.
    #[must_use]
    pub fn new(
        diagnosis: Arc<dyn IncidentAgent>,
        prediction: Arc<dyn IncidentAgent>,
        registry: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            diagnosis: StageAdapter::new(diagnosis, registry.clone()),
            prediction: StageAdapter::new(prediction, registry),
        }
    }
}

#[async_trait]
impl StageNode for AnalysisNode {
    async fn run(&self, state: &GraphState) -> Result<StageUpdate> {
        let (diagnosis, prediction) =
            tokio::join!(self.diagnosis.run(state), self.prediction.run(state));
        Ok(diagnosis?.merged_with(prediction?))
    }
}

/// Consensus stage: arbitrates all recommendations gathered so far.
pub struct ConsensusNode {
    engine: ConsensusEngine,
}

impl ConsensusNode {
    /// Wrap a consensus engine as a pipeline stage.
    #[must_use]
    pub fn new(engine: ConsensusEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StageNode for ConsensusNode {
    async fn run(&self, state: &GraphState) -> Result<StageUpdate> {
        let gathered = state.gathered_recommendations();
        let decision = self.engine.reach_consensus(&state.incident, &gathered);

        let message = format!(
            "consensus selected {} ({}, confidence {:.2})",
            decision.action, decision.consensus_method, decision.final_confidence
        );
        let mut update = StageUpdate::new()
            .with_event(
                TimelineEvent::new("consensus", None, message)
                    .with_metadata("escalate", serde_json::json!(decision.escalate)),
            )
            .with_context(
                CONSENSUS_ACTION_KEY,
                serde_json::to_value(decision.action)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )
            .with_context(
                "consensus_completed_at",
                serde_json::json!(Utc::now().to_rfc3339()),
            );
        update.consensus = Some(decision);
        Ok(update)
    }
}

/// Resolution stage: executes the arbitrated action via the resolution agent.
pub struct ResolutionNode {
    agent: Arc<dyn IncidentAgent>,
    registry: Arc<BreakerRegistry>,
}

impl ResolutionNode {
    /// Wrap the resolution agent.
    #[must_use]
    pub fn new(agent: Arc<dyn IncidentAgent>, registry: Arc<BreakerRegistry>) -> Self {
        Self { agent, registry }
    }
}

#[async_trait]
impl StageNode for ResolutionNode {
    async fn run(&self, state: &GraphState) -> Result<StageUpdate> {
        let breaker = self.registry.breaker("agent:resolution");
        let recs = breaker
            .call(|| self.agent.process(&state.incident, &state.context))
            .await?;

        // Prefer the recommendation that matches the consensus action.
        let decision_action = state.consensus.as_ref().map(|d| d.action);
        let chosen = recs
            .iter()
            .find(|r| Some(r.action) == decision_action)
            .or_else(|| recs.first())
            .cloned();

        let escalated = state.consensus.as_ref().is_some_and(|d| d.escalate);
        let status = if escalated {
            IncidentStatus::Escalated
        } else {
            IncidentStatus::Resolved
        };

        let message = match &chosen {
            Some(rec) => format!("resolution executed {}", rec.action),
            None => "resolution agent produced no executable step".to_string(),
        };

        let mut update = StageUpdate::new()
            .with_status(status)
            .with_event(TimelineEvent::new(
                "resolution",
                AgentType::Resolution,
                message,
            ))
            .with_context(
                "resolution_completed_at",
                serde_json::json!(Utc::now().to_rfc3339()),
            );
        update.resolution = chosen;
        Ok(update)
    }
}

/// Communication stage: renders a summary and hands it to the publisher.
///
/// Best-effort: failures here never abort the run.
pub struct CommunicationNode {
    agent: Arc<dyn IncidentAgent>,
    registry: Arc<BreakerRegistry>,
    publisher: Option<Arc<dyn SummaryPublisher>>,
}

impl CommunicationNode {
    /// Wrap the communication agent and an optional bus publisher.
    #[must_use]
    pub fn new(
        agent: Arc<dyn IncidentAgent>,
        registry: Arc<BreakerRegistry>,
        publisher: Option<Arc<dyn SummaryPublisher>>,
    ) -> Self {
        Self {
            agent,
            registry,
            publisher,
        }
    }
}

#[async_trait]
impl StageNode for CommunicationNode {
    fn best_effort(&self) -> bool {
        true
    }

    async fn run(&self, state: &GraphState) -> Result<StageUpdate> {
        let breaker = self.registry.breaker("agent:communication");
        let recs = breaker
            .call(|| self.agent.process(&state.incident, &state.context))
            .await?;

        let recipients: Vec<String> = recs
            .first()
            .and_then(|r| r.parameters.get("recipients"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let action = state
            .consensus
            .as_ref()
            .map(|d| d.action.to_string())
            .unwrap_or_else(|| "none".to_string());
        let mut summary = CommunicationSummary {
            recipients: recipients.clone(),
            message: format!(
                "[{}] {} - action: {}",
                state.incident.severity, state.incident.title, action
            ),
            published: false,
        };

        if let Some(publisher) = &self.publisher {
            match publisher.publish_summary(&state.incident, &summary).await {
                Ok(()) => summary.published = true,
                Err(e) => {
                    // Best-effort: log and keep the summary in the state.
                    warn!(incident_id = %state.incident.id, error = %e, "Summary publish failed");
                }
            }
        }

        let mut update = StageUpdate::new()
            .with_event(
                TimelineEvent::new(
                    "communication",
                    AgentType::Communication,
                    format!("notified {} recipient(s)", summary.recipients.len()),
                )
                .with_metadata("recipients", serde_json::json!(recipients)),
            )
            .with_context(
                "communication_completed_at",
                serde_json::json!(Utc::now().to_rfc3339()),
            );
        update.communication = Some(summary);
        Ok(update)
    }
}

/// The agents serving the five standard pipeline stages.
pub struct PipelineAgents {
    /// Detection stage agent
    pub detection: Arc<dyn IncidentAgent>,
    /// Diagnosis stage agent
    pub diagnosis: Arc<dyn IncidentAgent>,
    /// Prediction stage agent
    pub prediction: Arc<dyn IncidentAgent>,
    /// Resolution stage agent
    pub resolution: Arc<dyn IncidentAgent>,
    /// Communication stage agent
    pub communication: Arc<dyn IncidentAgent>,
}

impl Default for PipelineAgents {
    fn default() -> Self {
        Self {
            detection: Arc::new(crate::agents::DetectionAgent),
            diagnosis: Arc::new(crate::agents::DiagnosisAgent),
            prediction: Arc::new(crate::agents::PredictionAgent),
            resolution: Arc::new(crate::agents::ResolutionAgent),
            communication: Arc::new(crate::agents::CommunicationAgent),
        }
    }
}

/// Build the standard pipeline graph:
/// START → detection → analysis → consensus → resolution → communication → END,
/// with analysis fanning out into concurrent diagnosis and prediction.
pub fn standard_pipeline(
    agents: PipelineAgents,
    engine: ConsensusEngine,
    registry: Arc<BreakerRegistry>,
    publisher: Option<Arc<dyn SummaryPublisher>>,
) -> Result<IncidentGraph> {
    let mut graph = IncidentGraph::new();

    graph.add_node(
        "detection",
        Arc::new(StageAdapter::new(agents.detection, registry.clone())),
    )?;
    graph.add_node(
        "analysis",
        Arc::new(AnalysisNode::new(
            agents.diagnosis,
            agents.prediction,
            registry.clone(),
        )),
    )?;
    graph.add_node("consensus", Arc::new(ConsensusNode::new(engine)))?;
    graph.add_node(
        "resolution",
        Arc::new(ResolutionNode::new(agents.resolution, registry.clone())),
    )?;
    graph.add_node(
        "communication",
        Arc::new(CommunicationNode::new(
            agents.communication,
            registry,
            publisher,
        )),
    )?;

    graph.add_edge(START_NODE, "detection")?;
    graph.add_edge("detection", "analysis")?;
    graph.add_edge("analysis", "consensus")?;
    graph.add_edge("consensus", "resolution")?;
    graph.add_edge("resolution", "communication")?;
    graph.add_edge("communication", END_NODE)?;

    Ok(graph)
}
