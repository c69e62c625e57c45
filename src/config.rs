use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::change_feed::{BackoffPolicy, WatcherConfig};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MONITOR_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_FEED_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 60;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const CONFIG_DIR: &str = "config";

/// Application configuration, layered from `config/default.toml`, an
/// environment-specific file and `STOCKWATCH_`-prefixed env vars.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Store backend: "memory" or "sql".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Database connection URL (sql backend only).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Low-stock sweep cadence.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_minutes: u64,

    /// Expired-notification cleanup cadence.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// change_log polling cadence (sql backend only).
    #[serde(default = "default_feed_poll_interval")]
    pub feed_poll_interval_ms: u64,

    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,

    /// Connect attempts before the watcher is permanently disabled.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_monitor_interval() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MINUTES
}
fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_feed_poll_interval() -> u64 {
    DEFAULT_FEED_POLL_INTERVAL_MS
}
fn default_reconnect_base_delay() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}
fn default_reconnect_max_delay() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_SECS
}
fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: default_database_url(),
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            monitor_interval_minutes: default_monitor_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            feed_poll_interval_ms: default_feed_poll_interval(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl AppConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        let base = Duration::from_millis(self.reconnect_base_delay_ms);
        let max_delay = Duration::from_secs(self.reconnect_max_delay_secs);
        WatcherConfig {
            connect_backoff: BackoffPolicy::bounded(base, max_delay, self.max_reconnect_attempts),
            stream_backoff: BackoffPolicy::unbounded(base, max_delay),
        }
    }
}

/// Loads configuration: defaults file, environment file, env var overlay.
/// All sources are optional; built-in defaults apply otherwise.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    Config::builder()
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false))
        .add_source(Environment::with_prefix("STOCKWATCH").separator("__"))
        .build()?
        .try_deserialize()
}

/// Initializes the global tracing subscriber. Call once at startup.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
