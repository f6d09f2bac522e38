//! Visited-set BFS executor over an adjacency map.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::incident::Incident;

use super::state::{GraphState, StageUpdate};

/// Reserved entry node name.
pub const START_NODE: &str = "START";
/// Reserved exit node name.
pub const END_NODE: &str = "END";

/// One pipeline stage.
///
/// Implementations return a partial update; they never mutate the shared
/// state directly.
#[async_trait]
pub trait StageNode: Send + Sync {
    /// Run the stage against the current state.
    async fn run(&self, state: &GraphState) -> Result<StageUpdate>;

    /// Best-effort stages log failures instead of aborting the run.
    fn best_effort(&self) -> bool {
        false
    }
}

/// The result of one graph run.
///
/// A failed run still carries the state of every stage that completed and a
/// timeline documenting where it stopped.
#[derive(Debug)]
pub struct GraphRunOutcome {
    /// Final (possibly partial) state
    pub state: GraphState,
    /// The fatal error, if a required stage failed
    pub error: Option<Error>,
}

impl GraphRunOutcome {
    /// Whether the run completed without a fatal stage error.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// A small DAG executor for named pipeline stages.
///
/// Each node is visited at most once per run; the visited set makes
/// revisiting impossible by construction, which is a deliberate simplicity
/// constraint rather than a general-workflow feature.
pub struct IncidentGraph {
    nodes: HashMap<String, Arc<dyn StageNode>>,
    edges: HashMap<String, Vec<String>>,
}

impl IncidentGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// Register a node under a name. `START` and `END` are reserved.
    pub fn add_node(&mut self, name: impl Into<String>, node: Arc<dyn StageNode>) -> Result<()> {
        let name = name.into();
        if name == START_NODE || name == END_NODE {
            return Err(Error::Graph(format!("'{name}' is a reserved node name")));
        }
        if self.nodes.insert(name.clone(), node).is_some() {
            return Err(Error::Graph(format!("node '{name}' registered twice")));
        }
        Ok(())
    }

    /// Declare an edge. Both endpoints must be registered (or reserved).
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> Result<()> {
        let from = from.into();
        let to = to.into();
        for name in [&from, &to] {
            let reserved = name == START_NODE || name == END_NODE;
            if !reserved && !self.nodes.contains_key(name.as_str()) {
                return Err(Error::Graph(format!("edge references unknown node '{name}'")));
            }
        }
        self.edges.entry(from).or_default().push(to);
        Ok(())
    }

    /// Run the graph on one incident.
    ///
    /// Performs a breadth-first walk from `START`: dequeue a node, run it,
    /// merge its partial update, then enqueue unvisited successors. An error
    /// from a required node ends the run; the outcome still carries the
    /// partial state. This never panics the caller.
    pub async fn run(
        &self,
        incident: Incident,
        initial_context: HashMap<String, serde_json::Value>,
    ) -> GraphRunOutcome {
        let incident_id = incident.id;
        let mut state = GraphState::new(incident, initial_context);

        let start_successors = match self.edges.get(START_NODE) {
            Some(next) if !next.is_empty() => next.clone(),
            _ => {
                return GraphRunOutcome {
                    state,
                    error: Some(Error::Graph("no edges out of START".to_string())),
                }
            }
        };

        info!(incident_id = %incident_id, "Pipeline run starting");

        let mut queue: VecDeque<String> = start_successors.into();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(START_NODE.to_string());

        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if name == END_NODE {
                continue;
            }

            let Some(node) = self.nodes.get(&name) else {
                return GraphRunOutcome {
                    state,
                    error: Some(Error::Graph(format!("reached unregistered node '{name}'"))),
                };
            };

            debug!(incident_id = %incident_id, stage = %name, "Running stage");
            match node.run(&state).await {
                Ok(update) => {
                    state.apply(update);
                }
                Err(e) if node.best_effort() => {
                    warn!(
                        incident_id = %incident_id,
                        stage = %name,
                        error = %e,
                        "Best-effort stage failed, continuing"
                    );
                }
                Err(e) => {
                    error!(
                        incident_id = %incident_id,
                        stage = %name,
                        error = %e,
                        "Required stage failed, ending run"
                    );
                    return GraphRunOutcome {
                        state,
                        error: Some(e),
                    };
                }
            }

            if let Some(successors) = self.edges.get(&name) {
                for next in successors {
                    if !visited.contains(next) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }

        info!(
            incident_id = %incident_id,
            stages = state.timeline.len(),
            "Pipeline run complete"
        );
        GraphRunOutcome { state, error: None }
    }
}

impl Default for IncidentGraph {
    fn default() -> Self {
        Self::new()
    }
}
