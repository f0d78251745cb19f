//! Audit log records and query types

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Upper bound on the query window
pub const MAX_QUERY_LIMIT: i64 = 1000;

fn default_limit() -> i64 {
    50
}

/// Coarse verb recorded with every entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Create,
    Update,
    Delete,
    Access,
    Authenticate,
    Process,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Create => "CREATE",
            EventAction::Update => "UPDATE",
            EventAction::Delete => "DELETE",
            EventAction::Access => "ACCESS",
            EventAction::Authenticate => "AUTHENTICATE",
            EventAction::Process => "PROCESS",
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry to be written; identity and `created_at` are assigned by the database
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditLog {
    pub trace_id: String,
    pub span_id: Option<String>,
    pub event_type: String,
    pub event_action: EventAction,
    pub service_name: String,
    pub user_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub event_data: Value,
    pub metadata: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Persisted audit log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRecord {
    pub id: i64,
    pub trace_id: String,
    pub span_id: Option<String>,
    pub event_type: String,
    pub event_action: String,
    pub service_name: String,
    pub user_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub event_data: Value,
    pub metadata: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Query filter for `GET /api/audit-logs`
///
/// Every present field is ANDed; date bounds are inclusive. Bounds accept
/// RFC 3339 or a bare `YYYY-MM-DD`, which covers that whole UTC day.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogFilter {
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub service_name: Option<String>,
    pub trace_id: Option<String>,
    #[serde(default, deserialize_with = "start_bound")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "end_bound")]
    pub end_date: Option<DateTime<Utc>>,
    /// Page size (1-1000, default 50)
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Pagination offset (default 0)
    #[serde(default)]
    pub offset: i64,
}

impl AuditLogFilter {
    /// Window clamped to 1..=MAX_QUERY_LIMIT and a non-negative offset
    pub fn window(&self) -> (i64, i64) {
        (self.limit.clamp(1, MAX_QUERY_LIMIT), self.offset.max(0))
    }
}

fn start_bound<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    date_bound(d, NaiveTime::from_hms_opt(0, 0, 0))
}

fn end_bound<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    date_bound(d, NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999))
}

fn date_bound<'de, D: Deserializer<'de>>(
    d: D,
    day_time: Option<NaiveTime>,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .zip(day_time)
        .map(|(date, time)| Some(date.and_time(time).and_utc()))
        .ok_or_else(|| {
            D::Error::custom(format!(
                "invalid date {raw:?}: expected RFC 3339 or YYYY-MM-DD"
            ))
        })
}

/// One page of results plus the full filtered count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogPage {
    pub logs: Vec<AuditLogRecord>,
    pub total: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
