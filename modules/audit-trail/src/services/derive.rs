//! Audit entry derivation
//!
//! Total: never fails on missing or oddly-typed fields. Each field resolves as
//! explicit override, then envelope `data` / `metadata`, then fallback.

use event_bus::{producer_for_topic, EventEnvelope};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{EventAction, NewAuditLog};

/// Values supplied by the caller that win over anything found in the envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditOverrides {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub service_name: Option<String>,
    pub user_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Merged into the stored metadata (e.g. severity, tags)
    pub extra_metadata: Map<String, Value>,
}

pub fn derive_audit_entry(
    event_type: &str,
    event_action: EventAction,
    envelope: &EventEnvelope,
    overrides: AuditOverrides,
) -> NewAuditLog {
    let trace_id = overrides
        .trace_id
        .or_else(|| envelope.metadata_str(&["traceId", "trace_id"]))
        .or_else(|| envelope.data_str(&["traceId", "trace_id"]))
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span_id = overrides
        .span_id
        .or_else(|| envelope.metadata_str(&["spanId", "span_id"]));

    // A source the producer actually sent beats metadata; one inferred from
    // the topic does not
    let service_name = overrides
        .service_name
        .or_else(|| {
            Some(envelope.source.clone())
                .filter(|s| !envelope.source_inferred && !s.trim().is_empty())
        })
        .or_else(|| envelope.metadata_str(&["serviceName", "service_name"]))
        .unwrap_or_else(|| producer_for_topic(event_type));

    let user_id = overrides
        .user_id
        .or_else(|| envelope.data_str(&["userId", "user_id"]))
        .or_else(|| envelope.metadata_str(&["userId", "user_id"]));

    let resource_id = overrides
        .resource_id
        .or_else(|| envelope.data_str(&["resourceId", "resource_id", "id"]));

    let resource_type = overrides
        .resource_type
        .or_else(|| envelope.data_str(&["resourceType", "resource_type"]))
        .or_else(|| {
            event_type
                .split('.')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        });

    let ip_address = overrides
        .ip_address
        .or_else(|| envelope.metadata_str(&["ipAddress", "ip_address", "ip"]));

    let user_agent = overrides
        .user_agent
        .or_else(|| envelope.metadata_str(&["userAgent", "user_agent"]));

    let mut metadata = envelope.metadata.clone().unwrap_or_default();
    metadata
        .entry("eventId")
        .or_insert_with(|| Value::String(envelope.event_id.clone()));
    metadata
        .entry("source")
        .or_insert_with(|| Value::String(envelope.source.clone()));
    metadata
        .entry("timestamp")
        .or_insert_with(|| Value::String(envelope.timestamp.clone()));
    metadata.extend(overrides.extra_metadata);

    NewAuditLog {
        trace_id,
        span_id,
        event_type: event_type.to_string(),
        event_action,
        service_name,
        user_id,
        resource_id,
        resource_type,
        event_data: Value::Object(envelope.data.clone()),
        metadata: Some(Value::Object(metadata)),
        ip_address,
        user_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(data: Value, metadata: Option<Value>) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(
            "user.created",
            "identity-service",
            data.as_object().cloned().unwrap_or_default(),
        )
        .with_event_id("evt-1");
        envelope.metadata = metadata.and_then(|m| m.as_object().cloned());
        envelope
    }

    #[test]
    fn test_values_taken_from_envelope() {
        let env = envelope(
            json!({"userId": "user-789", "resourceId": "r-1"}),
            Some(json!({
                "traceId": "trace-123",
                "spanId": "span-9",
                "ipAddress": "10.0.0.1",
                "userAgent": "curl/8"
            })),
        );

        let entry = derive_audit_entry("user.created", EventAction::Create, &env, Default::default());

        assert_eq!(entry.trace_id, "trace-123");
        assert_eq!(entry.span_id.as_deref(), Some("span-9"));
        assert_eq!(entry.service_name, "identity-service");
        assert_eq!(entry.user_id.as_deref(), Some("user-789"));
        assert_eq!(entry.resource_id.as_deref(), Some("r-1"));
        assert_eq!(entry.resource_type.as_deref(), Some("user"));
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(entry.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(entry.event_data, json!({"userId": "user-789", "resourceId": "r-1"}));
    }

    #[test]
    fn test_overrides_win() {
        let env = envelope(json!({"userId": "from-data"}), Some(json!({"traceId": "t-env"})));
        let overrides = AuditOverrides {
            trace_id: Some("t-override".to_string()),
            user_id: Some("from-override".to_string()),
            resource_type: Some("account".to_string()),
            service_name: Some("gateway".to_string()),
            ..Default::default()
        };

        let entry = derive_audit_entry("user.updated", EventAction::Update, &env, overrides);

        assert_eq!(entry.trace_id, "t-override");
        assert_eq!(entry.user_id.as_deref(), Some("from-override"));
        assert_eq!(entry.resource_type.as_deref(), Some("account"));
        assert_eq!(entry.service_name, "gateway");
    }

    #[test]
    fn test_fallbacks_when_everything_missing() {
        let mut env = envelope(json!({}), None);
        env.source = String::new();

        let entry = derive_audit_entry("order.created", EventAction::Create, &env, Default::default());

        assert!(Uuid::parse_str(&entry.trace_id).is_ok());
        assert_eq!(entry.service_name, "order-service");
        assert_eq!(entry.resource_type.as_deref(), Some("order"));
        assert!(entry.user_id.is_none());
        assert!(entry.span_id.is_none());
    }

    #[test]
    fn test_metadata_service_name_used_when_source_not_sent() {
        let payload = json!({
            "data": {},
            "metadata": {"serviceName": "billing-worker"}
        });
        let env = EventEnvelope::from_slice("invoice.created", payload.to_string().as_bytes())
            .unwrap();

        let entry = derive_audit_entry("invoice.created", EventAction::Create, &env, Default::default());
        assert_eq!(entry.service_name, "billing-worker");

        // A sent source still wins over metadata
        let payload = json!({
            "source": "invoice-api",
            "metadata": {"serviceName": "billing-worker"}
        });
        let env = EventEnvelope::from_slice("invoice.created", payload.to_string().as_bytes())
            .unwrap();

        let entry = derive_audit_entry("invoice.created", EventAction::Create, &env, Default::default());
        assert_eq!(entry.service_name, "invoice-api");
    }

    #[test]
    fn test_inferred_source_used_without_metadata() {
        let env = EventEnvelope::from_slice("invoice.created", b"{}").unwrap();

        let entry = derive_audit_entry("invoice.created", EventAction::Create, &env, Default::default());
        assert_eq!(entry.service_name, "invoice-service");
    }

    #[test]
    fn test_odd_types_do_not_fail() {
        let env = envelope(
            json!({"userId": 12345, "id": {"nested": true}, "resourceType": null}),
            Some(json!({"traceId": ["not", "a", "string"]})),
        );

        let entry = derive_audit_entry("user.created", EventAction::Create, &env, Default::default());

        assert_eq!(entry.user_id.as_deref(), Some("12345"));
        assert!(entry.resource_id.is_none());
        assert_eq!(entry.resource_type.as_deref(), Some("user"));
        assert!(Uuid::parse_str(&entry.trace_id).is_ok());
    }

    #[test]
    fn test_metadata_enriched_without_clobbering() {
        let env = envelope(json!({}), Some(json!({"source": "original", "tenant": "t-1"})));
        let mut extra = Map::new();
        extra.insert("severity".to_string(), json!("high"));

        let entry = derive_audit_entry(
            "user.deleted",
            EventAction::Delete,
            &env,
            AuditOverrides {
                extra_metadata: extra,
                ..Default::default()
            },
        );

        let metadata = entry.metadata.unwrap();
        assert_eq!(metadata["eventId"], "evt-1");
        assert_eq!(metadata["source"], "original");
        assert_eq!(metadata["tenant"], "t-1");
        assert_eq!(metadata["severity"], "high");
        assert!(metadata.get("timestamp").is_some());
    }
}
