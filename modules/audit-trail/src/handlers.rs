//! Catalog-driven event handler and dispatch table construction

use async_trait::async_trait;
use event_bus::{DispatchTable, EventEnvelope, EventHandler, HandlerError};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::catalog::{EventMapping, EVENT_CATALOG};
use crate::services::{AuditOverrides, AuditSink};

/// Writes one audit entry per event, shaped by its catalog row
pub struct AuditEventHandler {
    mapping: &'static EventMapping,
    sink: Arc<dyn AuditSink>,
}

impl AuditEventHandler {
    pub fn new(mapping: &'static EventMapping, sink: Arc<dyn AuditSink>) -> Self {
        Self { mapping, sink }
    }

    /// Catalog-specific values; anything not found here falls through to
    /// the generic derivation.
    fn overrides(&self, envelope: &EventEnvelope) -> AuditOverrides {
        let mut extra = Map::new();
        extra.insert(
            "severity".to_string(),
            Value::String(self.mapping.severity.as_str().to_string()),
        );
        extra.insert(
            "tags".to_string(),
            Value::Array(
                self.mapping
                    .tags
                    .iter()
                    .map(|t| Value::String((*t).to_string()))
                    .collect(),
            ),
        );

        AuditOverrides {
            resource_type: Some(self.mapping.resource_type.to_string()),
            resource_id: envelope.data_str(self.mapping.resource_id_keys),
            user_id: envelope.data_str(self.mapping.user_id_keys),
            extra_metadata: extra,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventHandler for AuditEventHandler {
    async fn handle(&self, envelope: EventEnvelope) -> Result<(), HandlerError> {
        let overrides = self.overrides(&envelope);
        let record = self
            .sink
            .write_audit_log_from_event(self.mapping.topic, self.mapping.action, &envelope, overrides)
            .await?;

        tracing::info!(
            event_type = %record.event_type,
            event_id = %envelope.event_id,
            audit_log_id = record.id,
            "Audit event recorded"
        );
        Ok(())
    }
}

/// One route per catalog row
pub fn build_dispatch_table(sink: Arc<dyn AuditSink>) -> DispatchTable {
    EVENT_CATALOG
        .iter()
        .fold(DispatchTable::builder(), |builder, mapping| {
            builder.route(
                mapping.topic,
                Arc::new(AuditEventHandler::new(mapping, sink.clone())),
            )
        })
        .build()
}
