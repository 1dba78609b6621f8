//! Configuration loading from file and environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use runstream_db::DbRuntimeSettings;
use runstream_log::LogSettings;

use crate::broker::BrokerSettings;
use crate::coordinator::CoordinatorSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event log retention settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Live delivery settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Background maintenance and run record retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Per-run event log limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Approximate cap on stored events per run.
    #[serde(default = "default_max_len")]
    pub max_len: u64,

    /// How far past `max_len` a log may grow before it is trimmed.
    #[serde(default = "default_trim_slack")]
    pub trim_slack: u64,

    /// Seconds a finished run's history stays readable.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Seconds an expired log keeps answering "expired" after it is purged.
    #[serde(default = "default_tombstone_retention_seconds")]
    pub tombstone_retention_seconds: u64,
}

/// Live stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Seconds of silence before a subscriber receives a heartbeat.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,

    /// Live buffer capacity per subscriber.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Page size for catch-up reads.
    #[serde(default = "default_catch_up_batch")]
    pub catch_up_batch: usize,
}

/// Maintenance task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Seconds a finished run's record is kept in memory.
    #[serde(default = "default_run_retention_seconds")]
    pub run_retention_seconds: u64,

    /// Seconds between maintenance sweeps.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "runstream_core=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "runstream.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_max_len() -> u64 {
    10_000
}

fn default_trim_slack() -> u64 {
    100
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_tombstone_retention_seconds() -> u64 {
    604_800
}

fn default_heartbeat_seconds() -> u64 {
    15
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_catch_up_batch() -> usize {
    500
}

fn default_run_retention_seconds() -> u64 {
    86_400
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            trim_slack: default_trim_slack(),
            ttl_seconds: default_ttl_seconds(),
            tombstone_retention_seconds: default_tombstone_retention_seconds(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat_seconds(),
            subscriber_buffer: default_subscriber_buffer(),
            catch_up_batch: default_catch_up_batch(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_retention_seconds: default_run_retention_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl LogConfig {
    pub fn settings(&self) -> LogSettings {
        LogSettings {
            max_len: self.max_len,
            trim_slack: self.trim_slack,
            tombstone_retention: Duration::from_secs(self.tombstone_retention_seconds),
        }
    }
}

impl StreamConfig {
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            heartbeat: Duration::from_secs(self.heartbeat_seconds.max(1)),
            subscriber_buffer: self.subscriber_buffer.max(1),
            catch_up_batch: self.catch_up_batch.max(1),
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl Config {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            log_ttl: Duration::from_secs(self.log.ttl_seconds),
            run_retention: Duration::from_secs(self.retention.run_retention_seconds),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `RUNSTREAM_DB_PATH` overrides `database.path`
/// - `RUNSTREAM_LOG_MAX_LEN` overrides `log.max_len`
/// - `RUNSTREAM_LOG_TTL_SECONDS` overrides `log.ttl_seconds`
/// - `RUNSTREAM_HEARTBEAT_SECONDS` overrides `stream.heartbeat_seconds`
/// - `RUNSTREAM_LOG_LEVEL` overrides `logging.level`
/// - `RUNSTREAM_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Unparseable numeric overrides are ignored.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(db_path) = std::env::var("RUNSTREAM_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(max_len) = env_parse("RUNSTREAM_LOG_MAX_LEN") {
        config.log.max_len = max_len;
    }
    if let Some(ttl) = env_parse("RUNSTREAM_LOG_TTL_SECONDS") {
        config.log.ttl_seconds = ttl;
    }
    if let Some(heartbeat) = env_parse("RUNSTREAM_HEARTBEAT_SECONDS") {
        config.stream.heartbeat_seconds = heartbeat;
    }
    if let Ok(level) = std::env::var("RUNSTREAM_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("RUNSTREAM_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
