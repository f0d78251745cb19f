//! Audit persistence and query service

use async_trait::async_trait;
use event_bus::EventEnvelope;
use sqlx::PgPool;

use crate::models::{AuditError, AuditLogFilter, AuditLogPage, AuditLogRecord, EventAction, NewAuditLog};
use crate::repos::audit_log_repo;
use crate::services::derive::{derive_audit_entry, AuditOverrides};

/// Destination for audit entries
///
/// Handlers depend on this trait rather than on the database so the
/// ingestion path can be exercised without Postgres.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one entry; returns only after the write has committed
    async fn write_audit_log(&self, entry: &NewAuditLog) -> Result<AuditLogRecord, AuditError>;

    /// Derive an entry from an event envelope, then persist it
    async fn write_audit_log_from_event(
        &self,
        event_type: &str,
        event_action: EventAction,
        envelope: &EventEnvelope,
        overrides: AuditOverrides,
    ) -> Result<AuditLogRecord, AuditError> {
        let entry = derive_audit_entry(event_type, event_action, envelope, overrides);
        self.write_audit_log(&entry).await
    }
}

/// Postgres-backed audit service
#[derive(Clone)]
pub struct AuditService {
    pool: PgPool,
}

impl AuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Filtered page plus full filtered count.
    ///
    /// Both queries run in one REPEATABLE READ transaction so `total` and
    /// `logs` describe the same snapshot.
    pub async fn get_audit_logs(&self, filter: &AuditLogFilter) -> Result<AuditLogPage, AuditError> {
        let (limit, offset) = filter.window();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let logs = audit_log_repo::query_page(&mut tx, filter, limit, offset).await?;
        let total = audit_log_repo::count(&mut tx, filter).await?;

        tx.commit().await?;

        Ok(AuditLogPage { logs, total })
    }

    pub async fn ping(&self) -> Result<(), AuditError> {
        audit_log_repo::ping(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditService {
    async fn write_audit_log(&self, entry: &NewAuditLog) -> Result<AuditLogRecord, AuditError> {
        let mut tx = self.pool.begin().await?;
        let record = audit_log_repo::insert(&mut tx, entry).await?;
        tx.commit().await?;

        tracing::debug!(
            audit_log_id = record.id,
            event_type = %record.event_type,
            trace_id = %record.trace_id,
            "Audit log written"
        );
        Ok(record)
    }
}
