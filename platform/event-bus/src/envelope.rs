//! # Event Envelope
//!
//! Inbound wrapper produced by upstream services. Producers are not uniform:
//! some send camelCase, some snake_case, some omit identifiers entirely. The
//! envelope is therefore parsed leniently and every missing field is filled
//! from a documented fallback.
//!
//! ## Fields and fallbacks
//!
//! - `eventId`: generated UUID v4
//! - `eventType`: the delivery topic
//! - `timestamp`: receipt time (RFC 3339, UTC)
//! - `source`: producer derived from the topic (`user.created` → `user-service`)
//! - `data`: empty object
//! - `metadata`: absent
//!
//! Numeric identifiers are stringified and a numeric `timestamp` is read as
//! epoch milliseconds. Any other non-string value in these fields counts as
//! missing.
//!
//! A payload that is not a JSON object, or whose `data`/`metadata` are not
//! objects, is rejected as malformed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Normalized event envelope handed to handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    /// ISO 8601 timestamp as sent by the producer
    pub timestamp: String,
    /// Producing service
    pub source: String,
    /// `source` was absent and derived from the topic
    #[serde(skip)]
    pub source_inferred: bool,
    pub data: Map<String, Value>,
    /// Correlation data (traceId, spanId, userId, ipAddress, userAgent, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed event payload on topic {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default, alias = "event_id")]
    event_id: Option<Value>,
    #[serde(default, alias = "event_type")]
    event_type: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    source: Option<Value>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl EventEnvelope {
    /// Build an envelope with generated id and current timestamp
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: now_rfc3339(),
            source: source.into(),
            source_inferred: false,
            data,
            metadata: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Parse a raw delivery body received on `topic`, applying fallbacks
    pub fn from_slice(topic: &str, payload: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_slice(payload).map_err(|source| EnvelopeError::Malformed {
                topic: topic.to_string(),
                source,
            })?;

        let source = scalar_str(raw.source);
        Ok(Self {
            event_id: scalar_str(raw.event_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: scalar_str(raw.event_type).unwrap_or_else(|| topic.to_string()),
            timestamp: timestamp_str(raw.timestamp).unwrap_or_else(now_rfc3339),
            source_inferred: source.is_none(),
            source: source.unwrap_or_else(|| producer_for_topic(topic)),
            data: raw.data.unwrap_or_default(),
            metadata: raw.metadata,
        })
    }

    /// Look up a string-ish metadata value, trying each key in order
    pub fn metadata_str(&self, keys: &[&str]) -> Option<String> {
        self.metadata.as_ref().and_then(|m| lookup_str(m, keys))
    }

    /// Look up a string-ish data value, trying each key in order
    pub fn data_str(&self, keys: &[&str]) -> Option<String> {
        lookup_str(&self.data, keys)
    }
}

/// Producer name conventionally responsible for a topic
///
/// `order.payment.failed` → `order-service`
pub fn producer_for_topic(topic: &str) -> String {
    match topic.split('.').next().filter(|s| !s.is_empty()) {
        Some(domain) => format!("{domain}-service"),
        None => "unknown-service".to_string(),
    }
}

/// Strings are returned as-is, numbers and booleans are stringified,
/// anything else is treated as absent.
fn lookup_str(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Non-blank strings as-is, numbers stringified, anything else absent
fn scalar_str(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_str(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        other => scalar_str(Some(other)),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_camel_case_envelope() {
        let payload = json!({
            "eventId": "evt-1",
            "eventType": "user.created",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "identity",
            "data": {"userId": "u-1"},
            "metadata": {"traceId": "t-1"}
        });

        let envelope =
            EventEnvelope::from_slice("user.created", payload.to_string().as_bytes()).unwrap();

        assert_eq!(envelope.event_id, "evt-1");
        assert_eq!(envelope.event_type, "user.created");
        assert_eq!(envelope.timestamp, "2024-01-01T00:00:00Z");
        assert_eq!(envelope.source, "identity");
        assert!(!envelope.source_inferred);
        assert_eq!(envelope.data_str(&["userId"]), Some("u-1".to_string()));
        assert_eq!(envelope.metadata_str(&["traceId"]), Some("t-1".to_string()));
    }

    #[test]
    fn test_snake_case_aliases_accepted() {
        let payload = br#"{"event_id":"evt-2","event_type":"order.created","data":{}}"#;

        let envelope = EventEnvelope::from_slice("order.created", payload).unwrap();

        assert_eq!(envelope.event_id, "evt-2");
        assert_eq!(envelope.event_type, "order.created");
    }

    #[test]
    fn test_missing_fields_fall_back() {
        let envelope = EventEnvelope::from_slice("payment.refunded", b"{}").unwrap();

        assert!(Uuid::parse_str(&envelope.event_id).is_ok());
        assert_eq!(envelope.event_type, "payment.refunded");
        assert_eq!(envelope.source, "payment-service");
        assert!(envelope.source_inferred);
        assert!(chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_ok());
        assert!(envelope.data.is_empty());
        assert!(envelope.metadata.is_none());
    }

    #[test]
    fn test_blank_strings_treated_as_missing() {
        let payload = br#"{"eventType":"  ","source":""}"#;

        let envelope = EventEnvelope::from_slice("file.uploaded", payload).unwrap();

        assert_eq!(envelope.event_type, "file.uploaded");
        assert_eq!(envelope.source, "file-service");
    }

    #[test]
    fn test_numeric_id_and_epoch_timestamp_accepted() {
        let payload = br#"{"eventId": 42, "timestamp": 1714564800000, "data": {}}"#;

        let envelope = EventEnvelope::from_slice("user.created", payload).unwrap();

        assert_eq!(envelope.event_id, "42");
        assert_eq!(envelope.timestamp, "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn test_non_scalar_identifiers_fall_back() {
        let payload = br#"{"eventId": {"v": 1}, "timestamp": true, "source": 7, "eventType": null}"#;

        let envelope = EventEnvelope::from_slice("order.created", payload).unwrap();

        assert!(Uuid::parse_str(&envelope.event_id).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_ok());
        assert_eq!(envelope.source, "7");
        assert_eq!(envelope.event_type, "order.created");
    }

    #[test]
    fn test_non_object_payload_is_malformed() {
        assert!(EventEnvelope::from_slice("user.created", b"[1,2,3]").is_err());
        assert!(EventEnvelope::from_slice("user.created", b"not json").is_err());
        assert!(EventEnvelope::from_slice("user.created", br#"{"data":"text"}"#).is_err());
    }

    #[test]
    fn test_producer_for_topic() {
        assert_eq!(producer_for_topic("order.payment.failed"), "order-service");
        assert_eq!(producer_for_topic("auth"), "auth-service");
        assert_eq!(producer_for_topic(""), "unknown-service");
    }

    #[test]
    fn test_lookup_stringifies_numbers_and_skips_objects() {
        let envelope = EventEnvelope::new(
            "order.created",
            "order-service",
            json!({"id": 42, "nested": {"a": 1}}).as_object().cloned().unwrap(),
        );

        assert_eq!(envelope.data_str(&["id"]), Some("42".to_string()));
        assert_eq!(envelope.data_str(&["nested"]), None);
        assert_eq!(envelope.data_str(&["missing", "id"]), Some("42".to_string()));
    }
}
