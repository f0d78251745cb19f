use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use event_bus::{BackoffConfig, ConsumerConfig};

use crate::transport::TransportMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("secret source unavailable: {0}")]
    SecretsUnavailable(String),
}

/// Broker names and consumer tuning
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_prefix: String,
    pub prefetch: u16,
    pub max_deliveries: u32,
    pub redelivery_base_delay: Duration,
    pub redelivery_max_delay: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl BrokerSettings {
    /// Consumer configuration for the given queue and topic bindings
    pub fn consumer_config(&self, queue: &str, bindings: Vec<String>) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(&self.exchange, queue, bindings);
        config.dead_letter_exchange = self.dead_letter_exchange.clone();
        config.dead_letter_prefix = self.dead_letter_prefix.clone();
        config.prefetch = self.prefetch;
        config.max_deliveries = self.max_deliveries;
        config.redelivery = BackoffConfig {
            base_delay: self.redelivery_base_delay,
            max_delay: self.redelivery_max_delay,
            max_attempts: 0,
        };
        config.reconnect = BackoffConfig {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
        };
        config
    }
}

/// Push transport (sidecar) settings
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub sidecar_health_url: String,
    pub probe_timeout: Duration,
    pub pubsub_name: String,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportMode,
    pub push: PushSettings,
    pub broker: BrokerSettings,
    pub migrations_dir: PathBuf,
    pub migrations_table: String,
    pub secrets_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `LOG_FORMAT=pretty` for human-readable output, JSON otherwise.
    ///
    /// Read on its own, ahead of [`Config::from_env`], so configuration
    /// errors are already logged in the chosen format.
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_var("PORT", 8095)?;

        let transport: TransportMode = parse_var("TRANSPORT_MODE", TransportMode::Auto)?;

        let push = PushSettings {
            sidecar_health_url: env::var("PUSH_SIDECAR_HEALTH_URL")
                .unwrap_or_else(|_| "http://localhost:3500/v1.0/healthz".to_string()),
            probe_timeout: Duration::from_millis(parse_var("PUSH_PROBE_TIMEOUT_MS", 500u64)?),
            pubsub_name: env::var("PUSH_PUBSUB_NAME")
                .unwrap_or_else(|_| "audit-pubsub".to_string()),
        };

        let broker = BrokerSettings {
            exchange: env::var("BROKER_EXCHANGE").unwrap_or_else(|_| "AUDIT_EVENTS".to_string()),
            dead_letter_exchange: env::var("BROKER_DEAD_LETTER_EXCHANGE")
                .unwrap_or_else(|_| "AUDIT_DLQ".to_string()),
            dead_letter_prefix: env::var("BROKER_DEAD_LETTER_PREFIX")
                .unwrap_or_else(|_| "audit.dlq".to_string()),
            prefetch: parse_var("BROKER_PREFETCH", 10u16)?,
            max_deliveries: parse_var("BROKER_MAX_DELIVERIES", 5u32)?,
            redelivery_base_delay: Duration::from_millis(parse_var(
                "REDELIVERY_BASE_DELAY_MS",
                1000u64,
            )?),
            redelivery_max_delay: Duration::from_millis(parse_var(
                "REDELIVERY_MAX_DELAY_MS",
                30_000u64,
            )?),
            reconnect_base_delay: Duration::from_millis(parse_var(
                "RECONNECT_BASE_DELAY_MS",
                1000u64,
            )?),
            reconnect_max_delay: Duration::from_millis(parse_var(
                "RECONNECT_MAX_DELAY_MS",
                60_000u64,
            )?),
            reconnect_max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", 10u32)?,
        };

        if broker.prefetch == 0 {
            return Err(ConfigError::Invalid {
                name: "BROKER_PREFETCH",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let migrations_dir = env::var("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/db/migrations")));

        let migrations_table =
            env::var("MIGRATIONS_TABLE").unwrap_or_else(|_| "schema_migrations".to_string());
        if !is_identifier(&migrations_table) {
            return Err(ConfigError::Invalid {
                name: "MIGRATIONS_TABLE",
                value: migrations_table,
                reason: "must be a plain SQL identifier".to_string(),
            });
        }

        let secrets_file = env::var("SECRETS_FILE").ok().map(PathBuf::from);

        Ok(Config {
            host,
            port,
            transport,
            push,
            broker,
            migrations_dir,
            migrations_table,
            secrets_file,
        })
    }
}

/// Read and parse an env var, falling back to `default` when unset
pub(crate) fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// ASCII letters, digits and underscores, not starting with a digit
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
