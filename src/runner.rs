//! Pipeline wiring: builds the agents, consensus engine, breakers, and bus,
//! runs the response graph for one incident, and reports the outcome.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use vigil_bus::{
    BusConfig, FastTransport, InMemoryDurableTransport, InMemoryFastTransport, MessageBus,
    Priority, RedisTransport,
};
use vigil_core::{
    standard_pipeline, BreakerRegistry, CommunicationSummary, ConsensusEngine, Incident,
    PipelineAgents, Severity, SummaryPublisher, VigilConfig,
};

/// One incident to respond to.
pub struct RespondRequest {
    /// Short incident title
    pub title: String,
    /// Free-form description
    pub description: String,
    /// Severity
    pub severity: Severity,
    /// Affected service, if known
    pub service: Option<String>,
    /// Downtime cost per minute, if known
    pub cost_per_minute: Option<f64>,
    /// Use Redis for the low-latency transport
    pub use_redis: bool,
}

/// Publishes communication summaries onto the message bus, one envelope per
/// recipient.
struct BusPublisher {
    bus: Arc<MessageBus>,
}

#[async_trait]
impl SummaryPublisher for BusPublisher {
    async fn publish_summary(
        &self,
        incident: &Incident,
        summary: &CommunicationSummary,
    ) -> std::result::Result<(), String> {
        for recipient in &summary.recipients {
            let payload = HashMap::from([
                ("incident_id".to_string(), serde_json::json!(incident.id)),
                ("severity".to_string(), serde_json::json!(incident.severity)),
                ("summary".to_string(), serde_json::json!(summary.message)),
            ]);
            let mut envelope =
                self.bus
                    .envelope("communication", recipient, "incident_summary", payload);
            if incident.severity >= Severity::High {
                envelope.priority = Priority::High;
            }
            self.bus
                .send_with_resilience(&envelope)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Run the full response pipeline for one incident.
pub async fn respond(config: VigilConfig, request: RespondRequest) -> Result<()> {
    let registry = Arc::new(BreakerRegistry::new(config.breaker.breaker_config()));
    let engine = ConsensusEngine::new(config.consensus.weights());

    let fast: Arc<dyn FastTransport> = if request.use_redis {
        Arc::new(
            RedisTransport::new(&config.bus.redis_url)
                .context("failed to build Redis transport")?,
        )
    } else {
        Arc::new(InMemoryFastTransport::new())
    };
    let durable = Arc::new(InMemoryDurableTransport::new(config.bus.max_retries));
    let bus = MessageBus::new(
        fast,
        durable,
        Arc::clone(&registry),
        BusConfig::from_settings(&config.bus),
    );

    let publisher = Arc::new(BusPublisher {
        bus: Arc::clone(&bus),
    });

    let graph = standard_pipeline(
        PipelineAgents::default(),
        engine,
        Arc::clone(&registry),
        Some(publisher),
    )?;

    let mut incident = Incident::new(request.title, request.description, request.severity);
    if let Some(service) = request.service {
        incident = incident.with_affected_service(service);
    }
    if let Some(cost) = request.cost_per_minute {
        incident = incident.with_cost_per_minute(cost);
    }

    info!(
        incident_id = %incident.id,
        severity = ?incident.severity,
        "Starting incident response pipeline"
    );

    let outcome = graph.run(incident, HashMap::new()).await;

    for event in &outcome.state.timeline {
        match &event.agent {
            Some(agent) => info!(phase = %event.phase, agent = %agent, "{}", event.message),
            None => info!(phase = %event.phase, "{}", event.message),
        }
    }

    if let Some(decision) = &outcome.state.consensus {
        info!(
            action = %decision.action.id(),
            confidence = decision.final_confidence,
            escalate = decision.escalate,
            "Consensus decision"
        );
    }
    info!(status = ?outcome.state.incident.status, "Final incident status");

    let health = registry.health_report();
    if health.degraded > 0 || health.unhealthy > 0 {
        warn!(
            healthy = health.healthy,
            degraded = health.degraded,
            unhealthy = health.unhealthy,
            "Some dependencies are not healthy"
        );
    }

    let stats = bus.stats().await;
    info!(
        sent = stats.sent,
        dead_lettered = stats.dead_lettered,
        "Bus delivery stats"
    );
    bus.shutdown().await;

    match outcome.error {
        None => Ok(()),
        Some(e) => Err(e).context("pipeline stage failed"),
    }
}
