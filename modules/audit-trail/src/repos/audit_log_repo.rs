//! Repository for the append-only `audit_logs` table
//!
//! Writes are single-row inserts. Reads share one predicate between the page
//! query and the count query so `total` always describes the same filter.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{AuditLogFilter, AuditLogRecord, NewAuditLog};

const COLUMNS: &str = r#"
    id, trace_id, span_id, event_type, event_action, service_name,
    user_id, resource_id, resource_type, event_data, metadata,
    ip_address, user_agent, created_at
"#;

/// Shared filter; `$1..$6` are bound by [`bind_filter`] in this order.
/// An absent parameter disables its condition.
const FILTER_PREDICATE: &str = r#"
    ($1::text IS NULL OR user_id = $1)
    AND ($2::text IS NULL OR event_type = $2)
    AND ($3::text IS NULL OR service_name = $3)
    AND ($4::text IS NULL OR trace_id = $4)
    AND ($5::timestamptz IS NULL OR created_at >= $5)
    AND ($6::timestamptz IS NULL OR created_at <= $6)
"#;

/// Insert one entry, binding every column explicitly (absent optionals as NULL)
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    entry: &NewAuditLog,
) -> Result<AuditLogRecord, sqlx::Error> {
    let query = format!(
        r#"
        INSERT INTO audit_logs (
            trace_id, span_id, event_type, event_action, service_name,
            user_id, resource_id, resource_type, event_data, metadata,
            ip_address, user_agent
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {COLUMNS}
        "#
    );

    sqlx::query_as::<_, AuditLogRecord>(&query)
        .bind(&entry.trace_id)
        .bind(&entry.span_id)
        .bind(&entry.event_type)
        .bind(entry.event_action.as_str())
        .bind(&entry.service_name)
        .bind(&entry.user_id)
        .bind(&entry.resource_id)
        .bind(&entry.resource_type)
        .bind(&entry.event_data)
        .bind(&entry.metadata)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .fetch_one(&mut **tx)
        .await
}

type FilterBinds<'a> = (
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn filter_binds(filter: &AuditLogFilter) -> FilterBinds<'_> {
    (
        filter.user_id.as_deref(),
        filter.event_type.as_deref(),
        filter.service_name.as_deref(),
        filter.trace_id.as_deref(),
        filter.start_date,
        filter.end_date,
    )
}

/// One window of matching rows, newest first (`created_at DESC, id DESC`)
pub async fn query_page(
    tx: &mut Transaction<'_, Postgres>,
    filter: &AuditLogFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditLogRecord>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {COLUMNS}
        FROM audit_logs
        WHERE {FILTER_PREDICATE}
        ORDER BY created_at DESC, id DESC
        LIMIT $7 OFFSET $8
        "#
    );

    let (user_id, event_type, service_name, trace_id, start, end) = filter_binds(filter);
    sqlx::query_as::<_, AuditLogRecord>(&query)
        .bind(user_id)
        .bind(event_type)
        .bind(service_name)
        .bind(trace_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut **tx)
        .await
}

/// Count of all rows matching the filter, ignoring the window
pub async fn count(
    tx: &mut Transaction<'_, Postgres>,
    filter: &AuditLogFilter,
) -> Result<i64, sqlx::Error> {
    let query = format!("SELECT COUNT(*) FROM audit_logs WHERE {FILTER_PREDICATE}");

    let (user_id, event_type, service_name, trace_id, start, end) = filter_binds(filter);
    let (total,): (i64,) = sqlx::query_as(&query)
        .bind(user_id)
        .bind(event_type)
        .bind(service_name)
        .bind(trace_id)
        .bind(start)
        .bind(end)
        .fetch_one(&mut **tx)
        .await?;

    Ok(total)
}

/// Readiness probe
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
