//! Incident and recommendation data model.
//!
//! `Incident` is owned by the run invoking the orchestration graph and is
//! immutable except for status/resolution updates performed by the graph.
//! `Recommendation` is a write-once value object produced by exactly one
//! agent for exactly one incident.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Incident severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Minor degradation, no customer impact
    Low,
    /// Noticeable degradation
    Medium,
    /// Significant customer impact
    High,
    /// Outage or data-loss territory
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Detected, not yet analyzed
    Detected,
    /// Under analysis by diagnosis/prediction agents
    Diagnosing,
    /// A resolution action is being executed
    Mitigating,
    /// Resolved, post-incident follow-up only
    Resolved,
    /// Escalated to a human on-call
    Escalated,
}

/// An operational incident moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Unique incident ID
    pub id: Uuid,
    /// Short human-readable title
    pub title: String,
    /// Free-form description (alert text, log excerpt)
    pub description: String,
    /// Severity at detection time
    pub severity: Severity,
    /// Current lifecycle status
    pub status: IncidentStatus,
    /// When the incident was detected
    pub detected_at: DateTime<Utc>,
    /// When the incident was resolved, if it has been
    pub resolved_at: Option<DateTime<Utc>>,
    /// Primary affected service, if known
    pub affected_service: Option<String>,
    /// Estimated business cost per minute of impact, if known
    pub cost_per_minute: Option<f64>,
    /// Free-form tags (region, team, alert source)
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Incident {
    /// Create a new incident in the `Detected` state.
    pub fn new(title: impl Into<String>, description: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            severity,
            status: IncidentStatus::Detected,
            detected_at: Utc::now(),
            resolved_at: None,
            affected_service: None,
            cost_per_minute: None,
            tags: HashMap::new(),
        }
    }

    /// Set the affected service.
    #[must_use]
    pub fn with_affected_service(mut self, service: impl Into<String>) -> Self {
        self.affected_service = Some(service.into());
        self
    }

    /// Set the estimated business cost per minute.
    #[must_use]
    pub fn with_cost_per_minute(mut self, cost: f64) -> Self {
        self.cost_per_minute = Some(cost);
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Whether this incident warrants escalation on severity alone.
    #[must_use]
    pub fn is_high_severity(&self) -> bool {
        self.severity >= Severity::High
    }
}

/// The type of agent that produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Watches telemetry and raises incidents
    Detection,
    /// Finds the likely root cause
    Diagnosis,
    /// Projects blast radius and trajectory
    Prediction,
    /// Proposes and executes remediation
    Resolution,
    /// Keeps stakeholders informed
    Communication,
}

impl AgentType {
    /// All agent types in pipeline order.
    pub const ALL: [AgentType; 5] = [
        AgentType::Detection,
        AgentType::Diagnosis,
        AgentType::Prediction,
        AgentType::Resolution,
        AgentType::Communication,
    ];
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detection => write!(f, "detection"),
            Self::Diagnosis => write!(f, "diagnosis"),
            Self::Prediction => write!(f, "prediction"),
            Self::Resolution => write!(f, "resolution"),
            Self::Communication => write!(f, "communication"),
        }
    }
}

/// Closed set of actions an agent may recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Page a human on-call
    Escalate,
    /// Restart the affected service
    Restart,
    /// Scale the affected service out
    Scale,
    /// Roll back the most recent deploy
    Rollback,
    /// Notify stakeholders without remediation
    Notify,
    /// Observe only
    NoOp,
}

impl ActionType {
    /// Stable identifier used for grouping and deterministic tie-breaks.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::Restart => "restart",
            Self::Scale => "scale",
            Self::Rollback => "rollback",
            Self::Notify => "notify",
            Self::NoOp => "no_op",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Risk attached to executing a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to execute automatically
    Low,
    /// Safe with monitoring
    Medium,
    /// Needs a second opinion
    High,
    /// Human approval required
    Critical,
}

/// A single agent's recommendation for one incident.
///
/// Write-once: construct it fully, never mutate it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Unique recommendation ID
    pub id: Uuid,
    /// Agent that produced this recommendation
    pub agent_type: AgentType,
    /// Incident this recommendation applies to
    pub incident_id: Uuid,
    /// Proposed action
    pub action: ActionType,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Risk of executing the action
    pub risk: RiskLevel,
    /// Free-form reasoning text
    pub reasoning: String,
    /// Urgency score in [0, 1]
    pub urgency: f64,
    /// Action parameters (target service, scale factor, ...)
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// When the recommendation was produced
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    /// Create a new recommendation. Confidence and urgency are clamped to [0, 1].
    pub fn new(
        agent_type: AgentType,
        incident_id: Uuid,
        action: ActionType,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type,
            incident_id,
            action,
            confidence: confidence.clamp(0.0, 1.0),
            risk: RiskLevel::Medium,
            reasoning: reasoning.into(),
            urgency: 0.5,
            parameters: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the risk level.
    #[must_use]
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Set the urgency score, clamped to [0, 1].
    #[must_use]
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = urgency.clamp(0.0, 1.0);
        self
    }

    /// Add an action parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}
