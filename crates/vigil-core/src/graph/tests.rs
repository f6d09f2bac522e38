use super::*;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::consensus::ConsensusEngine;
use crate::error::{Error, Result};
use crate::incident::{AgentType, Incident, IncidentStatus, Severity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn incident(severity: Severity) -> Incident {
    Incident::new("Checkout latency spike", "p99 above 2s", severity)
        .with_affected_service("checkout")
}

/// Node that appends a single marker event.
struct MarkerNode {
    phase: &'static str,
}

#[async_trait]
impl StageNode for MarkerNode {
    async fn run(&self, _state: &GraphState) -> Result<StageUpdate> {
        Ok(StageUpdate::new()
            .with_event(TimelineEvent::new(self.phase, None, "marker"))
            .with_context(self.phase, serde_json::json!(true)))
    }
}

/// Node that always fails.
struct FailingNode {
    best_effort: bool,
}

#[async_trait]
impl StageNode for FailingNode {
    fn best_effort(&self) -> bool {
        self.best_effort
    }

    async fn run(&self, _state: &GraphState) -> Result<StageUpdate> {
        Err(Error::stage("failing", "boom"))
    }
}

fn marker(phase: &'static str) -> Arc<dyn StageNode> {
    Arc::new(MarkerNode { phase })
}

#[test]
fn test_reserved_node_names_rejected() {
    let mut graph = IncidentGraph::new();
    assert!(graph.add_node(START_NODE, marker("a")).is_err());
    assert!(graph.add_node(END_NODE, marker("a")).is_err());
}

#[test]
fn test_edge_to_unknown_node_rejected() {
    let mut graph = IncidentGraph::new();
    graph.add_node("a", marker("a")).unwrap();
    assert!(graph.add_edge("a", "missing").is_err());
    assert!(graph.add_edge(START_NODE, "a").is_ok());
}

#[tokio::test]
async fn test_linear_walk_preserves_declared_order() {
    let mut graph = IncidentGraph::new();
    graph.add_node("a", marker("a")).unwrap();
    graph.add_node("b", marker("b")).unwrap();
    graph.add_node("c", marker("c")).unwrap();
    graph.add_edge(START_NODE, "a").unwrap();
    graph.add_edge("a", "b").unwrap();
    graph.add_edge("b", "c").unwrap();
    graph.add_edge("c", END_NODE).unwrap();

    let outcome = graph.run(incident(Severity::Low), HashMap::new()).await;
    assert!(outcome.is_complete());

    let phases: Vec<&str> = outcome
        .state
        .timeline
        .iter()
        .map(|e| e.phase.as_str())
        .collect();
    assert_eq!(phases, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_diamond_visits_each_node_once() {
    // a → {b, c} → d: d is reachable twice but must run once
    let mut graph = IncidentGraph::new();
    graph.add_node("a", marker("a")).unwrap();
    graph.add_node("b", marker("b")).unwrap();
    graph.add_node("c", marker("c")).unwrap();
    graph.add_node("d", marker("d")).unwrap();
    graph.add_edge(START_NODE, "a").unwrap();
    graph.add_edge("a", "b").unwrap();
    graph.add_edge("a", "c").unwrap();
    graph.add_edge("b", "d").unwrap();
    graph.add_edge("c", "d").unwrap();
    graph.add_edge("d", END_NODE).unwrap();

    let outcome = graph.run(incident(Severity::Low), HashMap::new()).await;
    assert!(outcome.is_complete());
    let d_visits = outcome
        .state
        .timeline
        .iter()
        .filter(|e| e.phase == "d")
        .count();
    assert_eq!(d_visits, 1);
    assert_eq!(outcome.state.timeline.len(), 4);
}

#[tokio::test]
async fn test_required_failure_returns_partial_state() {
    let mut graph = IncidentGraph::new();
    graph.add_node("a", marker("a")).unwrap();
    graph
        .add_node("broken", Arc::new(FailingNode { best_effort: false }))
        .unwrap();
    graph.add_node("after", marker("after")).unwrap();
    graph.add_edge(START_NODE, "a").unwrap();
    graph.add_edge("a", "broken").unwrap();
    graph.add_edge("broken", "after").unwrap();

    let outcome = graph.run(incident(Severity::Low), HashMap::new()).await;
    assert!(!outcome.is_complete());
    // Stage "a" completed and is documented; "after" never ran
    assert_eq!(outcome.state.timeline.len(), 1);
    assert_eq!(outcome.state.timeline[0].phase, "a");
    assert!(matches!(outcome.error, Some(Error::Stage { .. })));
}

#[tokio::test]
async fn test_best_effort_failure_is_swallowed() {
    let mut graph = IncidentGraph::new();
    graph
        .add_node("flaky", Arc::new(FailingNode { best_effort: true }))
        .unwrap();
    graph.add_node("after", marker("after")).unwrap();
    graph.add_edge(START_NODE, "flaky").unwrap();
    graph.add_edge("flaky", "after").unwrap();
    graph.add_edge("after", END_NODE).unwrap();

    let outcome = graph.run(incident(Severity::Low), HashMap::new()).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.state.timeline.len(), 1);
    assert_eq!(outcome.state.timeline[0].phase, "after");
}

#[tokio::test]
async fn test_empty_graph_reports_error() {
    let graph = IncidentGraph::new();
    let outcome = graph.run(incident(Severity::Low), HashMap::new()).await;
    assert!(matches!(outcome.error, Some(Error::Graph(_))));
}

#[test]
fn test_merge_rules() {
    let mut state = GraphState::new(incident(Severity::Low), HashMap::new());
    state
        .context
        .insert("keep".to_string(), serde_json::json!("old"));
    state
        .context
        .insert("overwrite".to_string(), serde_json::json!("old"));
    state
        .timeline
        .push(TimelineEvent::new("existing", None, "first"));

    let update = StageUpdate::new()
        .with_context("overwrite", serde_json::json!("new"))
        .with_event(TimelineEvent::new("appended", None, "second"));
    state.apply(update);

    // Shallow merge: untouched keys survive, updated keys overwrite
    assert_eq!(state.context["keep"], serde_json::json!("old"));
    assert_eq!(state.context["overwrite"], serde_json::json!("new"));
    // Timeline appends, never replaces or reorders
    assert_eq!(state.timeline.len(), 2);
    assert_eq!(state.timeline[0].phase, "existing");
    assert_eq!(state.timeline[1].phase, "appended");
}

#[test]
fn test_resolved_status_stamps_resolved_at() {
    let mut state = GraphState::new(incident(Severity::Low), HashMap::new());
    assert!(state.incident.resolved_at.is_none());

    state.apply(StageUpdate::new().with_status(IncidentStatus::Resolved));
    assert!(state.incident.resolved_at.is_some());
}

#[tokio::test]
async fn test_standard_pipeline_phase_order() {
    let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let graph = standard_pipeline(
        PipelineAgents::default(),
        ConsensusEngine::default(),
        registry,
        None,
    )
    .unwrap();

    let outcome = graph.run(incident(Severity::High), HashMap::new()).await;
    assert!(outcome.is_complete());

    let phases: Vec<&str> = outcome
        .state
        .timeline
        .iter()
        .map(|e| e.phase.as_str())
        .collect();
    assert_eq!(
        phases,
        vec![
            "detection",
            "diagnosis",
            "prediction",
            "consensus",
            "resolution",
            "communication"
        ]
    );
    assert!(outcome.state.consensus.is_some());
}

#[tokio::test]
async fn test_standard_pipeline_publish_failure_is_best_effort() {
    struct FailingPublisher;

    #[async_trait]
    impl SummaryPublisher for FailingPublisher {
        async fn publish_summary(
            &self,
            _incident: &Incident,
            _summary: &CommunicationSummary,
        ) -> std::result::Result<(), String> {
            Err("bus unreachable".to_string())
        }
    }

    let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let graph = standard_pipeline(
        PipelineAgents::default(),
        ConsensusEngine::default(),
        registry,
        Some(Arc::new(FailingPublisher)),
    )
    .unwrap();

    let outcome = graph.run(incident(Severity::Medium), HashMap::new()).await;
    assert!(outcome.is_complete());
    // The update is still merged; only the published flag reflects the failure
    let summary = outcome.state.communication.expect("summary present");
    assert!(!summary.published);
    assert!(!summary.recipients.is_empty());
}

#[tokio::test]
async fn test_publisher_receives_summary() {
    struct RecordingPublisher {
        called: AtomicBool,
    }

    #[async_trait]
    impl SummaryPublisher for RecordingPublisher {
        async fn publish_summary(
            &self,
            incident: &Incident,
            summary: &CommunicationSummary,
        ) -> std::result::Result<(), String> {
            assert!(summary.message.contains(&incident.title));
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let publisher = Arc::new(RecordingPublisher {
        called: AtomicBool::new(false),
    });
    let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let graph = standard_pipeline(
        PipelineAgents::default(),
        ConsensusEngine::default(),
        registry,
        Some(publisher.clone()),
    )
    .unwrap();

    let outcome = graph.run(incident(Severity::High), HashMap::new()).await;
    assert!(publisher.called.load(Ordering::SeqCst));
    assert!(outcome.state.communication.unwrap().published);
}

#[tokio::test]
async fn test_mocked_diagnosis_drives_consensus() {
    use crate::agents::MockIncidentAgent;
    use crate::incident::{ActionType, Recommendation};

    let mut diagnosis = MockIncidentAgent::new();
    diagnosis
        .expect_agent_type()
        .return_const(AgentType::Diagnosis);
    diagnosis.expect_process().returning(|incident, _context| {
        Ok(vec![Recommendation::new(
            AgentType::Diagnosis,
            incident.id,
            ActionType::Rollback,
            0.95,
            "Mocked root cause: bad deploy",
        )])
    });

    let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let agents = PipelineAgents {
        diagnosis: Arc::new(diagnosis),
        ..PipelineAgents::default()
    };
    let graph = standard_pipeline(agents, ConsensusEngine::default(), registry, None).unwrap();

    // Medium severity, latency text: detection proposes Scale at lower weight,
    // so the high-confidence mocked diagnosis must win arbitration
    let outcome = graph.run(incident(Severity::Medium), HashMap::new()).await;
    assert!(outcome.is_complete());
    let decision = outcome.state.consensus.expect("consensus decision");
    assert_eq!(decision.action, ActionType::Rollback);
    assert!(decision.supporting_agents.contains(&AgentType::Diagnosis));
}

#[tokio::test]
async fn test_agent_failure_trips_breaker_and_stops_run() {
    struct ExplodingAgent;

    #[async_trait]
    impl crate::agents::IncidentAgent for ExplodingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Detection
        }

        async fn process(
            &self,
            _incident: &Incident,
            _context: &HashMap<String, serde_json::Value>,
        ) -> Result<Vec<crate::incident::Recommendation>> {
            Err(Error::Internal("agent crashed".to_string()))
        }
    }

    let registry = Arc::new(BreakerRegistry::new(
        BreakerConfig::default().with_failure_threshold(1),
    ));
    let agents = PipelineAgents {
        detection: Arc::new(ExplodingAgent),
        ..PipelineAgents::default()
    };
    let graph =
        standard_pipeline(agents, ConsensusEngine::default(), registry.clone(), None).unwrap();

    let outcome = graph.run(incident(Severity::High), HashMap::new()).await;
    assert!(!outcome.is_complete());
    assert!(matches!(outcome.error, Some(Error::Breaker(_))));

    // The failure was accounted against the detection agent's breaker
    let breaker = registry.breaker("agent:detection");
    assert_eq!(breaker.stats().failure_count, 1);
}
