use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

use super::{
    detect_drift, load_migrations, plan_pending, MigrationConfig, MigrationError, MigrationFile,
    MigrationRecord, MigrationReport, ValidationReport,
};
use crate::config::is_identifier;

/// Serializes concurrent starters across processes
const MIGRATION_LOCK_KEY: i64 = 0x4155_4449_545f_4d47; // "AUDIT_MG"

#[derive(Clone)]
pub struct MigrationRunner {
    pool: PgPool,
    config: MigrationConfig,
}

impl MigrationRunner {
    pub fn new(pool: PgPool, config: MigrationConfig) -> Result<Self, MigrationError> {
        if !is_identifier(&config.table_name) {
            return Err(MigrationError::InvalidTableName(config.table_name));
        }
        Ok(Self { pool, config })
    }

    /// Apply every unexecuted migration, in order. Safe to call on every start.
    pub async fn run_migrations(&self) -> Result<MigrationReport, MigrationError> {
        let start = Instant::now();
        self.ensure_history_table().await?;

        let files = load_migrations(&self.config.migrations_dir)?;
        let executed: HashSet<String> = self
            .executed()
            .await?
            .into_iter()
            .map(|r| r.migration_name)
            .collect();

        let pending = plan_pending(&files, &executed);
        let mut report = MigrationReport {
            skipped: files.len() - pending.len(),
            ..Default::default()
        };

        for file in pending {
            if self.apply(file).await? {
                report.applied.push(file.name.clone());
            } else {
                report.skipped += 1;
            }
        }

        report.elapsed = start.elapsed();
        info!(
            applied = report.applied.len(),
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Migrations complete"
        );
        Ok(report)
    }

    /// Recompute checksums of executed migrations and report drift.
    ///
    /// Drift is logged as a warning and returned; it is never an error and
    /// history is never modified.
    pub async fn validate_migrations(&self) -> Result<ValidationReport, MigrationError> {
        self.ensure_history_table().await?;
        let records = self.executed().await?;
        let files = load_migrations(&self.config.migrations_dir)?;

        let report = detect_drift(&files, &records);

        for mismatch in &report.mismatches {
            warn!(
                migration = %mismatch.name,
                recorded = %mismatch.recorded,
                current = %mismatch.current,
                "Migration checksum drift: file changed after it was applied"
            );
        }
        for name in &report.missing {
            warn!(migration = %name, "Executed migration file is missing from disk");
        }

        Ok(report)
    }

    /// History rows ordered by name
    pub async fn executed(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let query = format!(
            r#"
            SELECT migration_name, executed_at, execution_time_ms, checksum
            FROM {}
            ORDER BY migration_name ASC
            "#,
            self.config.table_name
        );

        let records = sqlx::query_as::<_, MigrationRecord>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn ensure_history_table(&self) -> Result<(), MigrationError> {
        let table = &self.config.table_name;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id SERIAL PRIMARY KEY,
                migration_name VARCHAR(255) NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time_ms BIGINT NOT NULL,
                checksum VARCHAR(64) NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {table}_migration_name_key ON {table} (migration_name);
            CREATE INDEX IF NOT EXISTS {table}_executed_at_idx ON {table} (executed_at);
            "#
        );

        let mut tx = self.pool.begin().await?;
        lock(&mut tx).await?;
        sqlx::raw_sql(&ddl).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Returns false when another process applied the migration first
    async fn apply(&self, file: &MigrationFile) -> Result<bool, MigrationError> {
        let failed = |e: sqlx::Error| MigrationError::MigrationFailed {
            name: file.name.clone(),
            message: e.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        lock(&mut tx).await?;

        let already: Option<(i32,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {} WHERE migration_name = $1",
            self.config.table_name
        ))
        .bind(&file.name)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Ok(false);
        }

        info!(migration = %file.name, "Applying migration");
        let start = Instant::now();

        sqlx::raw_sql(&file.sql)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        let elapsed_ms = start.elapsed().as_millis() as i64;

        sqlx::query(&format!(
            "INSERT INTO {} (migration_name, execution_time_ms, checksum) VALUES ($1, $2, $3)",
            self.config.table_name
        ))
        .bind(&file.name)
        .bind(elapsed_ms)
        .bind(&file.checksum)
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

        tx.commit().await.map_err(failed)?;

        info!(migration = %file.name, execution_time_ms = elapsed_ms, "Migration applied");
        Ok(true)
    }
}

async fn lock(tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
