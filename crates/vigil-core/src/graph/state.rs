//! Shared pipeline state and the stage-merge contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::consensus::ConsensusDecision;
use crate::incident::{AgentType, Incident, IncidentStatus, Recommendation};

use super::pipeline::CommunicationSummary;

/// Immutable audit record of one pipeline phase completing.
///
/// Append-only; ordering equals causal execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Phase name (detection, diagnosis, ...)
    pub phase: String,
    /// Agent type that owns the phase; `None` for orchestrator-owned phases
    /// such as consensus
    pub agent: Option<AgentType>,
    /// Human-readable summary of what happened
    pub message: String,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the phase completed
    pub timestamp: DateTime<Utc>,
}

impl TimelineEvent {
    /// Create a timeline event stamped now.
    pub fn new(
        phase: impl Into<String>,
        agent: impl Into<Option<AgentType>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase: phase.into(),
            agent: agent.into(),
            message: message.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The mutable envelope threaded through the pipeline.
///
/// Stages never mutate this directly; they return a [`StageUpdate`] that the
/// executor merges via [`GraphState::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    /// The incident this run is handling
    pub incident: Incident,
    /// Open context map, shallow-merged key by key
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Append-only audit timeline
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
    /// Detection stage recommendations
    #[serde(default)]
    pub detection: Vec<Recommendation>,
    /// Diagnosis stage recommendations
    #[serde(default)]
    pub diagnosis: Vec<Recommendation>,
    /// Prediction stage recommendations
    #[serde(default)]
    pub prediction: Vec<Recommendation>,
    /// Arbitrated decision, set by the consensus stage
    pub consensus: Option<ConsensusDecision>,
    /// Recommendation the resolution stage acted on
    pub resolution: Option<Recommendation>,
    /// Summary produced by the communication stage
    pub communication: Option<CommunicationSummary>,
}

impl GraphState {
    /// Create the initial state for one run.
    #[must_use]
    pub fn new(incident: Incident, context: HashMap<String, serde_json::Value>) -> Self {
        Self {
            incident,
            context,
            timeline: Vec::new(),
            detection: Vec::new(),
            diagnosis: Vec::new(),
            prediction: Vec::new(),
            consensus: None,
            resolution: None,
            communication: None,
        }
    }

    /// All recommendations gathered so far, in stage order.
    #[must_use]
    pub fn gathered_recommendations(&self) -> Vec<Recommendation> {
        self.detection
            .iter()
            .chain(self.diagnosis.iter())
            .chain(self.prediction.iter())
            .cloned()
            .collect()
    }

    /// Merge one stage's partial update.
    ///
    /// Merge rules: stage outputs and status are overwritten when present,
    /// `context` is shallow-merged key by key, and `timeline` is appended,
    /// never replaced or reordered.
    pub fn apply(&mut self, update: StageUpdate) {
        if let Some(status) = update.status {
            self.incident.status = status;
            if status == IncidentStatus::Resolved && self.incident.resolved_at.is_none() {
                self.incident.resolved_at = Some(Utc::now());
            }
        }
        for (key, value) in update.context {
            self.context.insert(key, value);
        }
        self.timeline.extend(update.timeline);
        if let Some(recs) = update.detection {
            self.detection = recs;
        }
        if let Some(recs) = update.diagnosis {
            self.diagnosis = recs;
        }
        if let Some(recs) = update.prediction {
            self.prediction = recs;
        }
        if let Some(decision) = update.consensus {
            self.consensus = Some(decision);
        }
        if let Some(rec) = update.resolution {
            self.resolution = Some(rec);
        }
        if let Some(summary) = update.communication {
            self.communication = Some(summary);
        }
    }
}

/// A partial state update returned by one stage.
///
/// Everything is optional; absent fields leave the state untouched.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    /// New incident status
    pub status: Option<IncidentStatus>,
    /// Context entries to shallow-merge
    pub context: HashMap<String, serde_json::Value>,
    /// Timeline events to append
    pub timeline: Vec<TimelineEvent>,
    /// Detection recommendations
    pub detection: Option<Vec<Recommendation>>,
    /// Diagnosis recommendations
    pub diagnosis: Option<Vec<Recommendation>>,
    /// Prediction recommendations
    pub prediction: Option<Vec<Recommendation>>,
    /// Consensus decision
    pub consensus: Option<ConsensusDecision>,
    /// Executed resolution recommendation
    pub resolution: Option<Recommendation>,
    /// Communication summary
    pub communication: Option<CommunicationSummary>,
}

impl StageUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the incident status.
    #[must_use]
    pub fn with_status(mut self, status: IncidentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Append a timeline event.
    #[must_use]
    pub fn with_event(mut self, event: TimelineEvent) -> Self {
        self.timeline.push(event);
        self
    }

    /// Merge another update into this one, left to right: the other update's
    /// scalar fields win, context entries overwrite, timelines concatenate.
    #[must_use]
    pub fn merged_with(mut self, other: StageUpdate) -> Self {
        self.status = other.status.or(self.status);
        self.context.extend(other.context);
        self.timeline.extend(other.timeline);
        self.detection = other.detection.or(self.detection);
        self.diagnosis = other.diagnosis.or(self.diagnosis);
        self.prediction = other.prediction.or(self.prediction);
        self.consensus = other.consensus.or(self.consensus);
        self.resolution = other.resolution.or(self.resolution);
        self.communication = other.communication.or(self.communication);
        self
    }
}
