//! Configuration for the candle ingestion service
//!
//! Configuration is read from the environment (UPPER_SNAKE keys such as
//! `KAFKA_BOOTSTRAP_SERVERS`), optionally merged on top of a YAML file,
//! and converted into an immutable [`AppConfig`] at startup. Parsing and
//! validation happen once, before any component is built; a bad value
//! fails the process fast instead of surfacing mid-stream.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Broker subscription settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker endpoints
    pub bootstrap_servers: Vec<String>,
    /// Topic to consume
    pub topic: String,
    /// Consumer group id
    pub group_id: String,
    /// Starting poll timeout, clamped to the controller rails
    pub initial_poll_timeout: Duration,
    /// Starting max batch size, clamped to the controller rails
    pub initial_max_batch_size: usize,
}

impl KafkaConfig {
    /// Comma-joined broker list in the form rdkafka expects.
    pub fn broker_list(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

/// Database endpoint and pool settings.
#[derive(Debug, Clone)]
pub struct TimescaleDbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

/// Batch insert settings.
#[derive(Debug, Clone)]
pub struct InsertConfig {
    /// Hard cap on the batcher regardless of controller output
    pub batch_size: usize,
    /// Age trigger for sealing a partial batch
    pub time_interval: Duration,
    /// Attempts per logical write
    pub retry_attempts: u32,
    /// Base delay for exponential backoff
    pub retry_delay: Duration,
}

/// Adaptive controller thresholds, rails and step sizes.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub latency_threshold_high: Duration,
    pub latency_threshold_low: Duration,
    pub poll_timeout_min: Duration,
    pub poll_timeout_max: Duration,
    pub batch_size_min: usize,
    pub batch_size_max: usize,
    pub poll_timeout_step: Duration,
    pub batch_size_step: usize,
    /// Number of latency samples in the sliding window
    pub window: usize,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub port: u16,
}

/// Shutdown drain settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Bound on the drain, terminationGracePeriodSeconds minus a margin
    pub grace_period: Duration,
}

/// Complete, validated service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub kafka: KafkaConfig,
    pub timescaledb: TimescaleDbConfig,
    pub insert: InsertConfig,
    pub controller: ControllerConfig,
    pub breaker: BreakerConfig,
    pub metrics: MetricsConfig,
    pub shutdown: ShutdownConfig,
    pub log_level: String,
}

/// Flat view of the environment, one field per configuration key.
///
/// Field names are the lowercase forms of the environment keys; figment's
/// `Env` provider lowercases keys before extraction.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub kafka_bootstrap_servers: Option<String>,
    pub kafka_topic: Option<String>,
    pub kafka_group_id: Option<String>,
    pub kafka_initial_poll_timeout: Option<f64>,
    pub kafka_initial_max_batch_size: Option<usize>,

    pub timescaledb_host: Option<String>,
    pub timescaledb_port: Option<u16>,
    pub timescaledb_dbname: Option<String>,
    pub timescaledb_user: Option<String>,
    pub timescaledb_password: Option<String>,
    pub timescaledb_pool_size: Option<u32>,
    pub timescaledb_connection_timeout: Option<f64>,

    pub insert_batch_size: Option<usize>,
    pub insert_time_interval: Option<f64>,
    pub insert_retry_attempts: Option<u32>,
    pub insert_retry_delay: Option<f64>,

    pub latency_threshold_high: Option<f64>,
    pub latency_threshold_low: Option<f64>,
    pub poll_timeout_min: Option<f64>,
    pub poll_timeout_max: Option<f64>,
    pub batch_size_min: Option<usize>,
    pub batch_size_max: Option<usize>,
    pub poll_timeout_step: Option<f64>,
    pub batch_size_step: Option<usize>,
    pub controller_window: Option<usize>,

    pub cb_failure_threshold: Option<u32>,
    pub cb_reset_timeout: Option<f64>,
    pub cb_half_open_timeout: Option<f64>,

    pub metrics_port: Option<u16>,
    pub shutdown_grace_period: Option<f64>,
    pub log_level: Option<String>,
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "{key} must be a non-negative number of seconds, got {value}"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

impl AppConfig {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// Environment variables take precedence over file values.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::raw());

        let raw: RawConfig = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let config = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Convert the raw key-value view into the typed configuration,
    /// applying defaults for absent keys.
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let bootstrap_servers = raw
            .kafka_bootstrap_servers
            .unwrap_or_else(|| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            kafka: KafkaConfig {
                bootstrap_servers,
                topic: raw.kafka_topic.unwrap_or_else(|| "coinbase.candles".into()),
                group_id: raw
                    .kafka_group_id
                    .unwrap_or_else(|| "timescale_ingest_group".into()),
                initial_poll_timeout: seconds(
                    "KAFKA_INITIAL_POLL_TIMEOUT",
                    raw.kafka_initial_poll_timeout.unwrap_or(1.0),
                )?,
                initial_max_batch_size: raw.kafka_initial_max_batch_size.unwrap_or(500),
            },
            timescaledb: TimescaleDbConfig {
                host: raw.timescaledb_host.unwrap_or_else(|| "localhost".into()),
                port: raw.timescaledb_port.unwrap_or(5432),
                dbname: raw.timescaledb_dbname.unwrap_or_else(|| "market_data".into()),
                user: raw.timescaledb_user.unwrap_or_else(|| "timescale_user".into()),
                password: raw
                    .timescaledb_password
                    .unwrap_or_else(|| "timescale_password".into()),
                pool_size: raw.timescaledb_pool_size.unwrap_or(10),
                connection_timeout: seconds(
                    "TIMESCALEDB_CONNECTION_TIMEOUT",
                    raw.timescaledb_connection_timeout.unwrap_or(10.0),
                )?,
            },
            insert: InsertConfig {
                batch_size: raw.insert_batch_size.unwrap_or(500),
                time_interval: seconds(
                    "INSERT_TIME_INTERVAL",
                    raw.insert_time_interval.unwrap_or(5.0),
                )?,
                retry_attempts: raw.insert_retry_attempts.unwrap_or(3),
                retry_delay: seconds("INSERT_RETRY_DELAY", raw.insert_retry_delay.unwrap_or(1.0))?,
            },
            controller: ControllerConfig {
                latency_threshold_high: seconds(
                    "LATENCY_THRESHOLD_HIGH",
                    raw.latency_threshold_high.unwrap_or(1.0),
                )?,
                latency_threshold_low: seconds(
                    "LATENCY_THRESHOLD_LOW",
                    raw.latency_threshold_low.unwrap_or(0.2),
                )?,
                poll_timeout_min: seconds("POLL_TIMEOUT_MIN", raw.poll_timeout_min.unwrap_or(0.5))?,
                poll_timeout_max: seconds("POLL_TIMEOUT_MAX", raw.poll_timeout_max.unwrap_or(5.0))?,
                batch_size_min: raw.batch_size_min.unwrap_or(100),
                batch_size_max: raw.batch_size_max.unwrap_or(2000),
                poll_timeout_step: seconds(
                    "POLL_TIMEOUT_STEP",
                    raw.poll_timeout_step.unwrap_or(0.5),
                )?,
                batch_size_step: raw.batch_size_step.unwrap_or(100),
                window: raw.controller_window.unwrap_or(16),
            },
            breaker: BreakerConfig {
                failure_threshold: raw.cb_failure_threshold.unwrap_or(5),
                reset_timeout: seconds("CB_RESET_TIMEOUT", raw.cb_reset_timeout.unwrap_or(60.0))?,
                half_open_timeout: seconds(
                    "CB_HALF_OPEN_TIMEOUT",
                    raw.cb_half_open_timeout.unwrap_or(30.0),
                )?,
            },
            metrics: MetricsConfig {
                port: raw.metrics_port.unwrap_or(8000),
            },
            shutdown: ShutdownConfig {
                grace_period: seconds(
                    "SHUTDOWN_GRACE_PERIOD",
                    raw.shutdown_grace_period.unwrap_or(25.0),
                )?,
            },
            log_level: raw.log_level.unwrap_or_else(|| "INFO".into()),
        })
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "KAFKA_BOOTSTRAP_SERVERS must list at least one broker".into(),
            ));
        }
        if self.kafka.topic.is_empty() {
            return Err(ConfigError::ValidationError(
                "KAFKA_TOPIC must not be empty".into(),
            ));
        }
        if self.kafka.initial_poll_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "KAFKA_INITIAL_POLL_TIMEOUT must be positive".into(),
            ));
        }
        if self.timescaledb.pool_size == 0 || self.timescaledb.pool_size > 100 {
            return Err(ConfigError::ValidationError(
                "TIMESCALEDB_POOL_SIZE must be between 1 and 100".into(),
            ));
        }
        if self.insert.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "INSERT_BATCH_SIZE must be positive".into(),
            ));
        }
        if self.insert.retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "INSERT_RETRY_ATTEMPTS must be at least 1".into(),
            ));
        }
        let c = &self.controller;
        if c.latency_threshold_high <= c.latency_threshold_low {
            return Err(ConfigError::ValidationError(
                "LATENCY_THRESHOLD_HIGH must exceed LATENCY_THRESHOLD_LOW".into(),
            ));
        }
        if c.poll_timeout_min > c.poll_timeout_max {
            return Err(ConfigError::ValidationError(
                "POLL_TIMEOUT_MIN must not exceed POLL_TIMEOUT_MAX".into(),
            ));
        }
        if c.batch_size_min == 0 || c.batch_size_min > c.batch_size_max {
            return Err(ConfigError::ValidationError(
                "BATCH_SIZE_MIN must be positive and not exceed BATCH_SIZE_MAX".into(),
            ));
        }
        if c.window == 0 {
            return Err(ConfigError::ValidationError(
                "CONTROLLER_WINDOW must be positive".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "CB_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.shutdown.grace_period.is_zero() {
            return Err(ConfigError::ValidationError(
                "SHUTDOWN_GRACE_PERIOD must be positive".into(),
            ));
        }
        Ok(())
    }
}
