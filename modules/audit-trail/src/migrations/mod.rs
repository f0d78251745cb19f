//! # Schema migrations
//!
//! Plain `*.sql` files applied in lexicographic file-name order, each exactly
//! once, each in its own transaction together with its history row. The
//! history row stores a SHA-256 of the file bytes so later edits to an
//! already-applied file can be detected (drift is reported, never repaired).

mod runner;

pub use runner::MigrationRunner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },

    #[error("migrations directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("migration {name} is not valid UTF-8")]
    InvalidEncoding { name: String },

    #[error("invalid history table name: {0}")]
    InvalidTableName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub migrations_dir: PathBuf,
    /// History table name; must be a plain identifier
    pub table_name: String,
}

impl MigrationConfig {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            table_name: "schema_migrations".to_string(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }
}

/// A migration file as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// File name, e.g. `0001_create_audit_logs.sql`
    pub name: String,
    pub sql: String,
    pub checksum: String,
}

impl MigrationFile {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self, MigrationError> {
        let name = name.into();
        let sql = std::str::from_utf8(bytes)
            .map_err(|_| MigrationError::InvalidEncoding { name: name.clone() })?
            .to_string();
        Ok(Self {
            name,
            sql,
            checksum: checksum(bytes),
        })
    }
}

/// One row of the history table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MigrationRecord {
    pub migration_name: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Names applied by this run, in order
    pub applied: Vec<String>,
    /// Files already recorded in history
    pub skipped: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub name: String,
    pub recorded: String,
    pub current: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Executed migrations compared against disk
    pub checked: usize,
    pub mismatches: Vec<ChecksumMismatch>,
    /// Executed migrations whose file no longer exists
    pub missing: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.missing.is_empty()
    }
}

/// Lowercase hex SHA-256 of the raw file bytes
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Load every `*.sql` file in `dir`, sorted by file name
pub fn load_migrations(dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    if !dir.is_dir() {
        return Err(MigrationError::DirectoryNotFound(dir.display().to_string()));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "sql"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    entries
        .into_iter()
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let bytes = std::fs::read(entry.path())?;
            MigrationFile::from_bytes(name, &bytes)
        })
        .collect()
}

/// Files not yet recorded as executed, preserving file order
pub fn plan_pending<'a>(
    files: &'a [MigrationFile],
    executed: &HashSet<String>,
) -> Vec<&'a MigrationFile> {
    files
        .iter()
        .filter(|file| !executed.contains(&file.name))
        .collect()
}

/// Compare recorded checksums with the files currently on disk
pub fn detect_drift(files: &[MigrationFile], records: &[MigrationRecord]) -> ValidationReport {
    let on_disk: HashMap<&str, &MigrationFile> =
        files.iter().map(|f| (f.name.as_str(), f)).collect();

    let mut report = ValidationReport {
        checked: records.len(),
        ..Default::default()
    };

    for record in records {
        match on_disk.get(record.migration_name.as_str()) {
            Some(file) if file.checksum != record.checksum => {
                report.mismatches.push(ChecksumMismatch {
                    name: record.migration_name.clone(),
                    recorded: record.checksum.clone(),
                    current: file.checksum.clone(),
                });
            }
            Some(_) => {}
            None => report.missing.push(record.migration_name.clone()),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn file(name: &str, sql: &str) -> MigrationFile {
        MigrationFile::from_bytes(name, sql.as_bytes()).unwrap()
    }

    fn record(name: &str, checksum: &str) -> MigrationRecord {
        MigrationRecord {
            migration_name: name.to_string(),
            executed_at: Utc::now(),
            execution_time_ms: 3,
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        // sha256("") is well known
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum(b"SELECT 1;").len(), 64);
    }

    #[test]
    fn test_checksum_changes_on_single_byte_edit() {
        assert_ne!(checksum(b"SELECT 1;"), checksum(b"SELECT 1; "));
    }

    #[test]
    fn test_load_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("0010_tenth.sql"), "SELECT 10;").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(dir.path().join("0003_dir.sql")).unwrap();

        let files = load_migrations(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();

        assert_eq!(names, vec!["0001_first.sql", "0002_second.sql", "0010_tenth.sql"]);
        assert_eq!(files[0].checksum, checksum(b"SELECT 1;"));
    }

    #[test]
    fn test_missing_directory() {
        let result = load_migrations(Path::new("/nonexistent/migrations"));
        assert!(matches!(result, Err(MigrationError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_plan_pending_skips_executed_in_order() {
        let files = vec![
            file("0001_a.sql", "A"),
            file("0002_b.sql", "B"),
            file("0003_c.sql", "C"),
        ];
        let executed: HashSet<String> = ["0002_b.sql".to_string()].into_iter().collect();

        let pending: Vec<_> = plan_pending(&files, &executed)
            .into_iter()
            .map(|f| f.name.as_str())
            .collect();

        assert_eq!(pending, vec!["0001_a.sql", "0003_c.sql"]);
    }

    #[test]
    fn test_plan_pending_empty_when_all_executed() {
        let files = vec![file("0001_a.sql", "A")];
        let executed: HashSet<String> = ["0001_a.sql".to_string()].into_iter().collect();

        assert!(plan_pending(&files, &executed).is_empty());
    }

    #[test]
    fn test_detect_drift_reports_mismatch_and_missing() {
        let files = vec![file("0001_a.sql", "A"), file("0002_b.sql", "B-edited")];
        let records = vec![
            record("0001_a.sql", &checksum(b"A")),
            record("0002_b.sql", &checksum(b"B")),
            record("0003_gone.sql", &checksum(b"C")),
        ];

        let report = detect_drift(&files, &records);

        assert_eq!(report.checked, 3);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].name, "0002_b.sql");
        assert_eq!(report.mismatches[0].current, checksum(b"B-edited"));
        assert_eq!(report.missing, vec!["0003_gone.sql"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_detect_drift_ignores_unexecuted_files() {
        let files = vec![file("0001_a.sql", "A"), file("0002_new.sql", "N")];
        let records = vec![record("0001_a.sql", &checksum(b"A"))];

        assert!(detect_drift(&files, &records).is_clean());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let result = MigrationFile::from_bytes("0001_bad.sql", &[0xff, 0xfe]);
        assert!(matches!(result, Err(MigrationError::InvalidEncoding { .. })));
    }

    #[test]
    fn test_bundled_migrations_load_in_order() {
        let dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/db/migrations"));
        let files = load_migrations(dir).unwrap();

        assert!(files.len() >= 3);
        assert!(files.windows(2).all(|w| w[0].name < w[1].name));
    }
}
