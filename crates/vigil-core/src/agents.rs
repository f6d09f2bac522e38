//! Agent trait seam and built-in heuristics.
//!
//! The interesting reasoning lives outside this core; these built-ins are
//! small keyword heuristics, just enough for the standard pipeline to run
//! end to end. Swap in real agents by implementing [`IncidentAgent`].

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::incident::{ActionType, AgentType, Incident, Recommendation, RiskLevel, Severity};

/// Context key the resolution stage uses to learn the consensus action.
pub const CONSENSUS_ACTION_KEY: &str = "consensus_action";

/// One logical producer of recommendations for a pipeline stage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IncidentAgent: Send + Sync {
    /// Which stage this agent serves.
    fn agent_type(&self) -> AgentType;

    /// Produce zero or more recommendations for the incident.
    ///
    /// Callers must tolerate an empty result.
    async fn process(
        &self,
        incident: &Incident,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>>;
}

fn text_of(incident: &Incident) -> String {
    format!("{} {}", incident.title, incident.description).to_lowercase()
}

fn severity_confidence(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.5,
        Severity::Medium => 0.65,
        Severity::High => 0.8,
        Severity::Critical => 0.9,
    }
}

/// Detection agent: classifies the alert text into an initial action.
///
/// Always produces at least one recommendation so downstream stages have a
/// signal to work with.
#[derive(Debug, Default)]
pub struct DetectionAgent;

#[async_trait]
impl IncidentAgent for DetectionAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Detection
    }

    async fn process(
        &self,
        incident: &Incident,
        _context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>> {
        let text = text_of(incident);
        let confidence = severity_confidence(incident.severity);

        let (action, reasoning) = if text.contains("latency") || text.contains("slow") {
            (ActionType::Scale, "Latency symptoms suggest capacity pressure")
        } else if text.contains("error") || text.contains("5xx") || text.contains("exception") {
            (ActionType::Rollback, "Error spike suggests a bad change")
        } else if text.contains("down") || text.contains("outage") || text.contains("crash") {
            (ActionType::Restart, "Availability loss, restart first")
        } else {
            (ActionType::Notify, "No clear signature, flag for triage")
        };

        Ok(vec![Recommendation::new(
            self.agent_type(),
            incident.id,
            action,
            confidence,
            reasoning,
        )
        .with_urgency(confidence)])
    }
}

/// Diagnosis agent: looks for a root-cause signature.
#[derive(Debug, Default)]
pub struct DiagnosisAgent;

#[async_trait]
impl IncidentAgent for DiagnosisAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Diagnosis
    }

    async fn process(
        &self,
        incident: &Incident,
        _context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>> {
        let text = text_of(incident);
        let mut recs = Vec::new();

        if text.contains("deploy") || text.contains("release") {
            recs.push(
                Recommendation::new(
                    self.agent_type(),
                    incident.id,
                    ActionType::Rollback,
                    0.85,
                    "Recent deploy correlates with onset",
                )
                .with_risk(RiskLevel::Medium),
            );
        } else if text.contains("memory") || text.contains("leak") {
            recs.push(
                Recommendation::new(
                    self.agent_type(),
                    incident.id,
                    ActionType::Restart,
                    0.75,
                    "Memory growth pattern, restart reclaims",
                )
                .with_risk(RiskLevel::Low),
            );
        } else if text.contains("latency") || text.contains("load") || text.contains("traffic") {
            recs.push(
                Recommendation::new(
                    self.agent_type(),
                    incident.id,
                    ActionType::Scale,
                    0.7,
                    "Load-correlated degradation, add capacity",
                )
                .with_risk(RiskLevel::Low),
            );
        }

        Ok(recs)
    }
}

/// Prediction agent: projects trajectory from severity and business impact.
#[derive(Debug, Default)]
pub struct PredictionAgent;

#[async_trait]
impl IncidentAgent for PredictionAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Prediction
    }

    async fn process(
        &self,
        incident: &Incident,
        _context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>> {
        let mut recs = Vec::new();

        if incident.severity >= Severity::High {
            let costly = incident.cost_per_minute.unwrap_or(0.0) > 1000.0;
            let action = if costly {
                ActionType::Escalate
            } else {
                ActionType::Scale
            };
            recs.push(
                Recommendation::new(
                    self.agent_type(),
                    incident.id,
                    action,
                    0.7,
                    "High severity trends worse without intervention",
                )
                .with_urgency(0.8),
            );
        }

        Ok(recs)
    }
}

/// Resolution agent: turns the consensus action into an executable step.
#[derive(Debug, Default)]
pub struct ResolutionAgent;

#[async_trait]
impl IncidentAgent for ResolutionAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Resolution
    }

    async fn process(
        &self,
        incident: &Incident,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>> {
        // Follow the arbitrated action when the consensus stage provided one.
        let action = context
            .get(CONSENSUS_ACTION_KEY)
            .and_then(|v| serde_json::from_value::<ActionType>(v.clone()).ok())
            .unwrap_or(ActionType::Notify);

        let target = incident
            .affected_service
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        Ok(vec![Recommendation::new(
            self.agent_type(),
            incident.id,
            action,
            0.8,
            format!("Executing {action} against {target}"),
        )
        .with_parameter("target_service", serde_json::json!(target))])
    }
}

/// Communication agent: picks stakeholders by severity.
#[derive(Debug, Default)]
pub struct CommunicationAgent;

#[async_trait]
impl IncidentAgent for CommunicationAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Communication
    }

    async fn process(
        &self,
        incident: &Incident,
        _context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Recommendation>> {
        let mut recipients = vec!["oncall".to_string()];
        if incident.severity >= Severity::High {
            recipients.push("incident-commander".to_string());
        }
        if incident.severity == Severity::Critical {
            recipients.push("leadership".to_string());
        }

        Ok(vec![Recommendation::new(
            self.agent_type(),
            incident.id,
            ActionType::Notify,
            0.9,
            "Stakeholders need a status update",
        )
        .with_parameter("recipients", serde_json::json!(recipients))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_context() -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_detection_always_recommends() {
        let agent = DetectionAgent;
        let incident = Incident::new("Mystery alert", "nothing recognizable", Severity::Low);

        let recs = agent.process(&incident, &no_context()).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].agent_type, AgentType::Detection);
    }

    #[tokio::test]
    async fn test_detection_flags_latency_as_scale() {
        let agent = DetectionAgent;
        let incident = Incident::new("Checkout latency spike", "p99 above 2s", Severity::High);

        let recs = agent.process(&incident, &no_context()).await.unwrap();
        assert_eq!(recs[0].action, ActionType::Scale);
        assert!(recs[0].confidence >= 0.8);
    }

    #[tokio::test]
    async fn test_diagnosis_may_return_nothing() {
        let agent = DiagnosisAgent;
        let incident = Incident::new("Odd blip", "unexplained", Severity::Low);

        let recs = agent.process(&incident, &no_context()).await.unwrap();
        assert!(recs.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_follows_consensus_action() {
        let agent = ResolutionAgent;
        let incident = Incident::new("DB down", "primary unreachable", Severity::Critical);
        let mut context = no_context();
        context.insert(
            CONSENSUS_ACTION_KEY.to_string(),
            serde_json::to_value(ActionType::Rollback).unwrap(),
        );

        let recs = agent.process(&incident, &context).await.unwrap();
        assert_eq!(recs[0].action, ActionType::Rollback);
    }

    #[tokio::test]
    async fn test_communication_recipients_grow_with_severity() {
        let agent = CommunicationAgent;
        let low = Incident::new("t", "d", Severity::Low);
        let critical = Incident::new("t", "d", Severity::Critical);

        let low_recs = agent.process(&low, &no_context()).await.unwrap();
        let crit_recs = agent.process(&critical, &no_context()).await.unwrap();

        let count = |recs: &[Recommendation]| {
            recs[0].parameters["recipients"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0)
        };
        assert_eq!(count(&low_recs), 1);
        assert_eq!(count(&crit_recs), 3);
    }
}
