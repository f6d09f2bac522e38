//! Weighted consensus engine
//!
//! Arbitrates between competing agent recommendations for one incident and
//! always produces a decision, even for empty input. Pure computation: no
//! I/O, no shared state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::incident::{ActionType, AgentType, Incident, Recommendation};

/// Consensus method recorded when no recommendations were available.
pub const WEIGHTED_FALLBACK: &str = "weighted_fallback";

/// Consensus method recorded for the normal weighted-vote path.
const WEIGHTED_VOTE: &str = "weighted_vote";

/// The arbitrated outcome of one consensus round.
///
/// Recomputed fresh per incident; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    /// Selected action; always present in at least one input recommendation
    /// unless the fallback path was taken
    pub action: ActionType,
    /// Raw weighted score of the winning action. Unnormalized: a ranking
    /// score, not a probability.
    pub final_confidence: f64,
    /// Arbitration method used ("weighted_vote" or "weighted_fallback")
    pub consensus_method: String,
    /// Whether the incident should be escalated to a human
    pub escalate: bool,
    /// Agent types that proposed the winning action
    pub supporting_agents: Vec<AgentType>,
    /// When the decision was computed
    pub created_at: DateTime<Utc>,
}

/// Per-agent-type weight table.
///
/// Defaults intentionally sum to more than 1.0 so that multi-agent agreement
/// amplifies the combined score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWeights {
    /// Weight for detection recommendations
    pub detection: f64,
    /// Weight for diagnosis recommendations
    pub diagnosis: f64,
    /// Weight for prediction recommendations
    pub prediction: f64,
    /// Weight for resolution recommendations
    pub resolution: f64,
    /// Weight for communication recommendations
    pub communication: f64,
}

impl Default for AgentWeights {
    fn default() -> Self {
        Self {
            detection: 0.9,
            diagnosis: 1.2,
            prediction: 1.0,
            resolution: 1.1,
            communication: 0.8,
        }
    }
}

impl AgentWeights {
    /// Weight for one agent type.
    #[must_use]
    pub fn weight(&self, agent: AgentType) -> f64 {
        match agent {
            AgentType::Detection => self.detection,
            AgentType::Diagnosis => self.diagnosis,
            AgentType::Prediction => self.prediction,
            AgentType::Resolution => self.resolution,
            AgentType::Communication => self.communication,
        }
    }
}

/// Predicate deciding whether consensus support is too fragmented to trust.
pub type FragmentationPredicate = Box<dyn Fn(f64, f64, usize) -> bool + Send + Sync>;

/// Weighted consensus engine.
pub struct ConsensusEngine {
    weights: AgentWeights,
    fragmentation: FragmentationPredicate,
}

impl ConsensusEngine {
    /// Create an engine with the given weight table and the default
    /// fragmentation predicate (winner holds less than half the total
    /// weighted score across two or more distinct actions).
    #[must_use]
    pub fn new(weights: AgentWeights) -> Self {
        Self {
            weights,
            fragmentation: Box::new(|winner, total, actions| {
                actions >= 2 && total > 0.0 && winner / total < 0.5
            }),
        }
    }

    /// Replace the fragmentation predicate.
    ///
    /// The predicate receives (winning score, total score, distinct action
    /// count) and returns true when support is too fragmented.
    #[must_use]
    pub fn with_fragmentation_predicate(mut self, predicate: FragmentationPredicate) -> Self {
        self.fragmentation = predicate;
        self
    }

    /// Arbitrate among the recommendations gathered for one incident.
    ///
    /// Never fails: an empty input produces the degenerate fallback decision
    /// so the pipeline always terminates with a decision object.
    #[must_use]
    pub fn reach_consensus(
        &self,
        incident: &Incident,
        recommendations: &[Recommendation],
    ) -> ConsensusDecision {
        if recommendations.is_empty() {
            debug!(incident_id = %incident.id, "No recommendations, using fallback decision");
            return Self::fallback_decision();
        }

        // Group by action; BTreeMap keeps action iteration deterministic.
        let mut groups: BTreeMap<ActionType, ActionGroup> = BTreeMap::new();
        for rec in recommendations {
            let weight = self.weights.weight(rec.agent_type);
            let group = groups.entry(rec.action).or_default();
            group.score += rec.confidence * weight;
            group.max_agent_weight = group.max_agent_weight.max(weight);
            if !group.agents.contains(&rec.agent_type) {
                group.agents.push(rec.agent_type);
            }
        }

        let total_score: f64 = groups.values().map(|g| g.score).sum();
        let action_count = groups.len();

        // Highest score wins. Exact ties prefer the action backed by the
        // heavier agent type, then the lexicographically smaller action id.
        let best = groups.into_iter().max_by(|(a_action, a), (b_action, b)| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.max_agent_weight
                        .partial_cmp(&b.max_agent_weight)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b_action.id().cmp(a_action.id()))
        });
        let Some((winner, group)) = best else {
            return Self::fallback_decision();
        };

        let fragmented = (self.fragmentation)(group.score, total_score, action_count);
        let escalate = incident.is_high_severity() || fragmented;

        debug!(
            incident_id = %incident.id,
            action = %winner,
            score = group.score,
            total = total_score,
            escalate = escalate,
            "Consensus reached"
        );

        ConsensusDecision {
            action: winner,
            final_confidence: group.score,
            consensus_method: WEIGHTED_VOTE.to_string(),
            escalate,
            supporting_agents: group.agents,
            created_at: Utc::now(),
        }
    }

    fn fallback_decision() -> ConsensusDecision {
        ConsensusDecision {
            action: ActionType::NoOp,
            final_confidence: 0.0,
            consensus_method: WEIGHTED_FALLBACK.to_string(),
            escalate: false,
            supporting_agents: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(AgentWeights::default())
    }
}

#[derive(Default)]
struct ActionGroup {
    score: f64,
    max_agent_weight: f64,
    agents: Vec<AgentType>,
}
