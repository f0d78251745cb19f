//! Secret providers
//!
//! Credentials come from a [`SecretProvider`] rather than being read ad hoc.
//! Production mounts a JSON document (`SECRETS_FILE`); local development
//! uses plain environment variables. [`FallbackSecretProvider`] tries the
//! primary source first and falls back to the environment.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::PathBuf;

use crate::config::{parse_var, ConfigError};

/// Database connection secrets
#[derive(Clone, Deserialize)]
pub struct DatabaseSecrets {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

impl std::fmt::Debug for DatabaseSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSecrets")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl DatabaseSecrets {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(if self.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            })
    }
}

/// Broker connection secrets
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSecrets {
    pub url: String,
    pub queue: String,
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn database(&self) -> Result<DatabaseSecrets, ConfigError>;

    async fn broker(&self) -> Result<BrokerSecrets, ConfigError>;
}

/// Reads `DB_*`, `NATS_URL` and `BROKER_QUEUE`
#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn database(&self) -> Result<DatabaseSecrets, ConfigError> {
        Ok(DatabaseSecrets {
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_var("DB_PORT", 5432u16)?,
            database: std::env::var("DB_NAME").unwrap_or_else(|_| "audit_db".to_string()),
            username: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            ssl: parse_var("DB_SSL", false)?,
        })
    }

    async fn broker(&self) -> Result<BrokerSecrets, ConfigError> {
        Ok(BrokerSecrets {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            queue: std::env::var("BROKER_QUEUE").unwrap_or_else(|_| "audit-trail".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SecretsDocument {
    database: DatabaseSecrets,
    broker: BrokerSecrets,
}

/// Reads a mounted JSON document of the form
/// `{"database": {...}, "broker": {"url": ..., "queue": ...}}`
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    path: PathBuf,
}

impl FileSecretProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<SecretsDocument, ConfigError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            ConfigError::SecretsUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            ConfigError::SecretsUnavailable(format!("{}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn database(&self) -> Result<DatabaseSecrets, ConfigError> {
        Ok(self.load().await?.database)
    }

    async fn broker(&self) -> Result<BrokerSecrets, ConfigError> {
        Ok(self.load().await?.broker)
    }
}

/// Primary provider with an environment fallback
pub struct FallbackSecretProvider<P> {
    primary: P,
    fallback: EnvSecretProvider,
}

impl<P: SecretProvider> FallbackSecretProvider<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            fallback: EnvSecretProvider,
        }
    }
}

#[async_trait]
impl<P: SecretProvider> SecretProvider for FallbackSecretProvider<P> {
    async fn database(&self) -> Result<DatabaseSecrets, ConfigError> {
        match self.primary.database().await {
            Ok(secrets) => Ok(secrets),
            Err(e) => {
                tracing::warn!(error = %e, "Primary secret source unavailable; using environment");
                self.fallback.database().await
            }
        }
    }

    async fn broker(&self) -> Result<BrokerSecrets, ConfigError> {
        match self.primary.broker().await {
            Ok(secrets) => Ok(secrets),
            Err(e) => {
                tracing::warn!(error = %e, "Primary secret source unavailable; using environment");
                self.fallback.broker().await
            }
        }
    }
}
