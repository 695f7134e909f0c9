//! Configuration for the gateway.
//!
//! Everything is sourced from environment variables. Missing required
//! values or a malformed encryption key abort startup; optional values
//! fall back to defaults.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

/// Default free-model allow-list when `FREE_ALLOWED_MODELS` is unset.
const DEFAULT_FREE_MODELS: &str = "qwen/qwen-2.5-7b-instruct";

/// One unit of cost deducts this many credit units unless overridden.
const DEFAULT_CREDITS_PER_COST_UNIT: u64 = 2_000_000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transactional store DSN.
    pub database_url: String,
    pub redis: RedisConfig,
    pub clickhouse: ClickHouseConfig,
    /// 64 hex chars; the AES key is derived from it by SHA-256.
    pub encryption_key: String,
    /// Models anonymous callers may use.
    pub free_allowed_models: Vec<String>,
    /// End-to-end timeout on the upstream call.
    pub request_timeout: Duration,
    /// Applies when an account has no explicit RPM limit.
    pub default_rate_limit_rpm: Option<u32>,
    pub spend: SpendConfig,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct SpendConfig {
    /// How often the settlement worker ticks.
    pub flush_interval: Duration,
    /// Maximum records drained per tick.
    pub batch_size: usize,
    /// Credit units deducted per unit of cost.
    pub credits_per_cost_unit: u64,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(5000),
            batch_size: 500,
            credits_per_cost_unit: DEFAULT_CREDITS_PER_COST_UNIT,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment, failing fast on anything
    /// required or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require("DATABASE_URL")?;
        let encryption_key = require("ENCRYPTION_KEY")?;
        validate_encryption_key(&encryption_key)?;

        let redis = RedisConfig {
            host: optional("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_optional("REDIS_PORT")?.unwrap_or(6379),
            db: parse_optional("REDIS_DB")?.unwrap_or(0),
            password: optional("REDIS_PASSWORD"),
        };

        let clickhouse = ClickHouseConfig {
            url: require("CLICKHOUSE_URL")?,
            username: optional("CLICKHOUSE_USERNAME").unwrap_or_else(|| "default".to_string()),
            password: optional("CLICKHOUSE_PASSWORD"),
            database: optional("CLICKHOUSE_DATABASE").unwrap_or_else(|| "default".to_string()),
        };

        let free_allowed_models = optional("FREE_ALLOWED_MODELS")
            .unwrap_or_else(|| DEFAULT_FREE_MODELS.to_string())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        let request_timeout = Duration::from_millis(
            parse_optional::<u64>("GATEWAY_REQUEST_TIMEOUT")?.unwrap_or(600_000),
        );

        let spend = SpendConfig {
            flush_interval: Duration::from_millis(
                parse_optional::<u64>("SPEND_FLUSH_INTERVAL_MS")?.unwrap_or(5000),
            ),
            credits_per_cost_unit: parse_optional::<u64>("CREDITS_PER_COST_UNIT")?
                .unwrap_or(DEFAULT_CREDITS_PER_COST_UNIT),
            ..SpendConfig::default()
        };

        Ok(Self {
            database_url,
            redis,
            clickhouse,
            encryption_key,
            free_allowed_models,
            request_timeout,
            default_rate_limit_rpm: parse_optional("DEFAULT_RATE_LIMIT_RPM")?,
            spend,
        })
    }

    pub fn model_is_free(&self, model: &str) -> bool {
        self.free_allowed_models.iter().any(|m| m == model)
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::MissingVar(var))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_optional<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn validate_encryption_key(key: &str) -> Result<(), ConfigError> {
    if key.len() != 64 || hex::decode(key).is_err() {
        return Err(ConfigError::InvalidVar {
            var: "ENCRYPTION_KEY",
            reason: "must be 64 hex characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_key_must_be_64_hex() {
        assert!(validate_encryption_key(&"ab".repeat(32)).is_ok());
        assert!(validate_encryption_key("deadbeef").is_err());
        assert!(validate_encryption_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut cfg = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            db: 2,
            password: None,
        };
        assert_eq!(cfg.url(), "redis://cache.internal:6380/2");
        cfg.password = Some("hunter2".to_string());
        assert_eq!(cfg.url(), "redis://:hunter2@cache.internal:6380/2");
    }

    #[test]
    fn spend_defaults() {
        let spend = SpendConfig::default();
        assert_eq!(spend.flush_interval, Duration::from_millis(5000));
        assert_eq!(spend.batch_size, 500);
        assert_eq!(spend.credits_per_cost_unit, 2_000_000);
    }
}
