use super::*;
use crate::envelope::Priority;
use crate::memory::{InMemoryDurableTransport, InMemoryFastTransport};
use crate::transport::{QueuedMessage, TransportError};
use tokio::sync::Mutex;
use vigil_core::breaker::BreakerConfig;

struct RecordingHandler {
    seen: Mutex<Vec<MessageEnvelope>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), String> {
        self.seen.lock().await.push(envelope);
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _envelope: MessageEnvelope) -> Result<(), String> {
        Err("handler exploded".to_string())
    }
}

struct BrokenFastTransport;

#[async_trait]
impl FastTransport for BrokenFastTransport {
    async fn push(
        &self,
        _queue: &str,
        _body: &str,
        _urgent: bool,
        _ttl: Duration,
    ) -> Result<(), TransportError> {
        Err(TransportError::Connection("fast transport offline".into()))
    }

    async fn pop(&self, _queue: &str) -> Result<Option<String>, TransportError> {
        Err(TransportError::Connection("fast transport offline".into()))
    }
}

/// Durable backend whose main queues are broken but whose DLQ still accepts
/// writes.
struct DlqOnlyDurable {
    dlq: Mutex<Vec<String>>,
}

#[async_trait]
impl DurableTransport for DlqOnlyDurable {
    async fn ensure_queue(&self, _name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, queue: &str, _body: &str) -> Result<(), TransportError> {
        Err(TransportError::Queue {
            queue: queue.to_string(),
            message: "queue service unavailable".into(),
        })
    }

    async fn receive(
        &self,
        _queue: &str,
        _max_messages: usize,
        _wait: Duration,
    ) -> Result<Vec<QueuedMessage>, TransportError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _queue: &str, _receipt: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_to_dlq(&self, _queue: &str, body: &str) -> Result<(), TransportError> {
        self.dlq.lock().await.push(body.to_string());
        Ok(())
    }
}

fn test_config() -> BusConfig {
    BusConfig {
        send_attempts: 3,
        send_base_delay: Duration::from_millis(10),
        default_ttl: Duration::from_secs(60),
        default_max_retries: 3,
        receive_wait: Duration::from_millis(50),
    }
}

fn make_bus(
    fast: Arc<dyn FastTransport>,
    durable: Arc<dyn DurableTransport>,
) -> Arc<MessageBus> {
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    MessageBus::new(fast, durable, breakers, test_config())
}

async fn wait_for(bus: &Arc<MessageBus>, pred: impl Fn(&BusStats) -> bool) -> BusStats {
    for _ in 0..150 {
        let stats = bus.stats().await;
        if pred(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bus.stats().await
}

#[tokio::test]
async fn test_send_and_deliver_via_fast_path() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(Arc::new(InMemoryFastTransport::new()), durable);

    let handler = RecordingHandler::new();
    bus.subscribe("resolution", handler.clone()).await.unwrap();

    let envelope = bus.envelope(
        "orchestrator",
        "resolution",
        "incident_update",
        HashMap::from([("incident_id".to_string(), serde_json::json!("inc-1"))]),
    );
    let id = bus.send(&envelope).await.unwrap();
    assert_eq!(id, envelope.id);

    let stats = wait_for(&bus, |s| s.delivered == 1).await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.fast_sends, 1);
    assert_eq!(stats.durable_sends, 0);

    let seen = handler.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, envelope.id);
    drop(seen);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_fast_failure_falls_back_to_durable() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(BrokenFastTransport),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let envelope = bus.envelope("orchestrator", "diagnosis", "incident_update", HashMap::new());
    bus.send(&envelope).await.unwrap();

    assert_eq!(durable.queue_depth("diagnosis").await, 1);
    let stats = bus.stats().await;
    assert_eq!(stats.durable_sends, 1);
    assert_eq!(stats.fast_sends, 0);
}

#[tokio::test]
async fn test_delivery_from_durable_when_fast_is_down() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(BrokenFastTransport),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let handler = RecordingHandler::new();
    bus.subscribe("detection", handler.clone()).await.unwrap();

    let envelope = bus.envelope("orchestrator", "detection", "incident_update", HashMap::new());
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.delivered == 1).await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(handler.seen.lock().await.len(), 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_unroutable_message_is_dead_lettered() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(InMemoryFastTransport::new()),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let envelope = bus.envelope("orchestrator", "ghost", "incident_update", HashMap::new());
    let body = serde_json::to_string(&envelope).unwrap();
    bus.dispatch("ghost", &body).await;

    let dlq = durable.dlq_messages("ghost").await;
    assert_eq!(dlq.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&dlq[0]).unwrap();
    assert_eq!(entry["dlq_reason"], DLQ_NO_HANDLER);
    assert!(entry["dlq_timestamp"].is_string());
    assert_eq!(entry["id"], serde_json::json!(envelope.id));
    assert_eq!(bus.stats().await.dead_lettered, 1);
}

#[tokio::test]
async fn test_expired_envelope_is_discarded_not_delivered() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(Arc::new(InMemoryFastTransport::new()), durable);

    let handler = RecordingHandler::new();
    bus.subscribe("comm", handler.clone()).await.unwrap();

    let envelope = MessageEnvelope::new(
        "orchestrator",
        "comm",
        "incident_update",
        HashMap::new(),
        Duration::ZERO,
        3,
    );
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.expired == 1).await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.delivered, 0);
    assert!(handler.seen.lock().await.is_empty());

    bus.shutdown().await;
}

#[tokio::test]
async fn test_expired_envelope_from_durable_is_discarded() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(BrokenFastTransport),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let handler = RecordingHandler::new();
    bus.subscribe("comm", handler.clone()).await.unwrap();

    let envelope = MessageEnvelope::new(
        "orchestrator",
        "comm",
        "incident_update",
        HashMap::new(),
        Duration::ZERO,
        3,
    );
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.expired == 1).await;
    assert_eq!(stats.durable_sends, 1);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.delivered, 0);
    assert!(handler.seen.lock().await.is_empty());

    bus.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_exhausts_retries_to_dlq() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(InMemoryFastTransport::new()),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    bus.subscribe("resolution", Arc::new(FailingHandler)).await.unwrap();

    // Zero retry budget: the first failure dead-letters
    let envelope = MessageEnvelope::new(
        "orchestrator",
        "resolution",
        "incident_update",
        HashMap::new(),
        Duration::from_secs(60),
        0,
    );
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.dead_lettered == 1).await;
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.delivered, 0);

    let dlq = durable.dlq_messages("resolution").await;
    assert_eq!(dlq.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&dlq[0]).unwrap();
    assert_eq!(entry["dlq_reason"], "Retry limit exceeded");
    assert_eq!(entry["retry_count"], 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_schedules_redelivery() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(Arc::new(InMemoryFastTransport::new()), durable);

    bus.subscribe("resolution", Arc::new(FailingHandler)).await.unwrap();

    let envelope = bus.envelope("orchestrator", "resolution", "incident_update", HashMap::new());
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.retried >= 1).await;
    assert!(stats.retried >= 1);
    assert_eq!(stats.dead_lettered, 0);

    // Shutdown cancels the pending redelivery sleep rather than waiting it out
    bus.shutdown().await;
}

#[tokio::test]
async fn test_urgent_envelope_jumps_the_queue() {
    let fast = Arc::new(InMemoryFastTransport::new());
    let bus = make_bus(
        Arc::clone(&fast) as Arc<dyn FastTransport>,
        Arc::new(InMemoryDurableTransport::default()),
    );

    let routine = bus.envelope("orchestrator", "oncall", "status", HashMap::new());
    let mut page = bus.envelope("orchestrator", "oncall", "page", HashMap::new());
    page.priority = Priority::Critical;

    bus.send(&routine).await.unwrap();
    bus.send(&page).await.unwrap();

    let first: MessageEnvelope =
        serde_json::from_str(&fast.pop("oncall").await.unwrap().unwrap()).unwrap();
    let second: MessageEnvelope =
        serde_json::from_str(&fast.pop("oncall").await.unwrap().unwrap()).unwrap();
    assert_eq!(first.id, page.id);
    assert_eq!(second.id, routine.id);
}

#[tokio::test]
async fn test_send_retries_then_dead_letters() {
    let durable = Arc::new(DlqOnlyDurable {
        dlq: Mutex::new(Vec::new()),
    });
    let bus = make_bus(
        Arc::new(BrokenFastTransport),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let envelope = bus.envelope("orchestrator", "detection", "incident_update", HashMap::new());
    let result = bus.send_with_resilience(&envelope).await;

    assert!(matches!(result, Err(BusError::DeadLettered { id }) if id == envelope.id));
    let dlq = durable.dlq.lock().await;
    assert_eq!(dlq.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&dlq[0]).unwrap();
    assert_eq!(entry["dlq_reason"], "Send retries exhausted");
}

#[tokio::test]
async fn test_send_failure_surfaces_as_breaker_error() {
    let durable = Arc::new(DlqOnlyDurable {
        dlq: Mutex::new(Vec::new()),
    });
    let bus = make_bus(Arc::new(BrokenFastTransport), durable);

    let envelope = bus.envelope("orchestrator", "detection", "incident_update", HashMap::new());
    let result = bus.send(&envelope).await;

    // Both legs are breaker-wrapped, so a double failure is a breaker error
    assert!(matches!(result, Err(BusError::Breaker(_))));
}

#[tokio::test]
async fn test_removed_handler_dead_letters_deliveries() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(
        Arc::new(InMemoryFastTransport::new()),
        Arc::clone(&durable) as Arc<dyn DurableTransport>,
    );

    let handler = RecordingHandler::new();
    bus.subscribe("database", handler.clone()).await.unwrap();
    bus.remove_handler("database").await;

    let envelope = bus.envelope("orchestrator", "database", "incident_update", HashMap::new());
    bus.send(&envelope).await.unwrap();

    let stats = wait_for(&bus, |s| s.dead_lettered == 1).await;
    assert_eq!(stats.dead_lettered, 1);
    assert!(handler.seen.lock().await.is_empty());

    let dlq = durable.dlq_messages("database").await;
    assert_eq!(dlq.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&dlq[0]).unwrap();
    assert_eq!(entry["dlq_reason"], DLQ_NO_HANDLER);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let durable = Arc::new(InMemoryDurableTransport::default());
    let bus = make_bus(Arc::new(InMemoryFastTransport::new()), durable);

    let handler = RecordingHandler::new();
    bus.subscribe("detection", handler.clone()).await.unwrap();
    assert_eq!(bus.stats().await.subscribers, 1);

    bus.unsubscribe("detection").await;
    assert_eq!(bus.stats().await.subscribers, 0);

    let envelope = bus.envelope("orchestrator", "detection", "incident_update", HashMap::new());
    bus.send(&envelope).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(handler.seen.lock().await.is_empty());

    bus.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let bus = make_bus(
        Arc::new(InMemoryFastTransport::new()),
        Arc::new(InMemoryDurableTransport::default()),
    );
    bus.shutdown().await;

    let envelope = bus.envelope("orchestrator", "detection", "incident_update", HashMap::new());
    assert!(matches!(bus.send(&envelope).await, Err(BusError::ShuttingDown)));
    assert!(matches!(
        bus.subscribe("detection", Arc::new(FailingHandler)).await,
        Err(BusError::ShuttingDown)
    ));
}
