use async_trait::async_trait;
use event_bus::{DispatchOutcome, Dispatcher};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub audit_dispatch_total: IntCounterVec,

    // Dependency gauges
    pub dep_up: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let audit_dispatch_total = IntCounterVec::new(
            Opts::new("audit_dispatch_total", "Events dispatched, by topic and outcome"),
            &["topic", "outcome"], // processed|unknown_topic|malformed|handler_failed
        )?;

        let dep_up = IntGaugeVec::new(
            Opts::new("audit_dependency_up", "Dependency up gauge"),
            &["dep"], // db|consumer|ready
        )?;

        registry.register(Box::new(audit_dispatch_total.clone()))?;
        registry.register(Box::new(dep_up.clone()))?;

        Ok(Self {
            registry,
            audit_dispatch_total,
            dep_up,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

/// Counts dispatch outcomes before handing them back to the transport
pub struct MeteredDispatcher {
    inner: Arc<dyn Dispatcher>,
    metrics: Metrics,
    known_topics: std::collections::HashSet<String>,
}

impl MeteredDispatcher {
    pub fn new(inner: Arc<dyn Dispatcher>, metrics: Metrics, known_topics: Vec<String>) -> Self {
        Self {
            inner,
            metrics,
            known_topics: known_topics.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Dispatcher for MeteredDispatcher {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let outcome = self.inner.dispatch(topic, payload).await;

        // Unknown topics share one label so producers cannot grow the series set
        let topic_label = if self.known_topics.contains(topic) {
            topic
        } else {
            "other"
        };
        self.metrics
            .audit_dispatch_total
            .with_label_values(&[topic_label, outcome.as_str()])
            .inc();

        outcome
    }
}
