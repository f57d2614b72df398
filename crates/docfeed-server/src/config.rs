//! Server configuration loading from file and environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use docfeed_db::{DbRuntimeSettings, NotifySettings, StoreSettings, DEFAULT_NOTIFY_PREFIX};
use docfeed_stream::StreamSettings;
use docfeed_types::TableName;
use serde::Deserialize;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Notification channel settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Cursor buffering and paging.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tables provisioned at startup.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Notification channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Channel names are `{prefix}_{table}`.
    #[serde(default = "default_notify_prefix")]
    pub prefix: String,

    /// Notifications buffered per channel before a slow subscriber lags.
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,
}

/// Cursor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_capacity")]
    pub output_capacity: usize,

    #[serde(default = "default_capacity")]
    pub backlog_capacity: usize,

    /// Rows fetched per historical page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Idle seconds before a live cursor pings the database.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "docfeed_stream=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// A document table to provision at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: TableName,

    /// Document paths to index, e.g. `"user.id"`.
    #[serde(default)]
    pub indexed_paths: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "docfeed.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_notify_prefix() -> String {
    DEFAULT_NOTIFY_PREFIX.to_string()
}

fn default_capacity() -> usize {
    1024
}

fn default_page_size() -> u64 {
    StreamSettings::default().page_size
}

fn default_keepalive_secs() -> u64 {
    StreamSettings::default().keepalive.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
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

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            prefix: default_notify_prefix(),
            channel_capacity: default_capacity(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            output_capacity: default_capacity(),
            backlog_capacity: default_capacity(),
            page_size: default_page_size(),
            keepalive_secs: default_keepalive_secs(),
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

impl Config {
    /// Settings for opening the store.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            db: DbRuntimeSettings {
                busy_timeout_ms: self.database.busy_timeout_ms,
                pool_max_size: self.database.pool_max_size,
            },
            notify: NotifySettings {
                channel_capacity: self.notify.channel_capacity,
            },
            notify_prefix: self.notify.prefix.clone(),
        }
    }

    /// Settings applied to every cursor.
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            output_capacity: self.stream.output_capacity,
            backlog_capacity: self.stream.backlog_capacity,
            page_size: self.stream.page_size,
            keepalive: Duration::from_secs(self.stream.keepalive_secs),
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
/// - `DOCFEED_HOST` overrides `server.host`
/// - `DOCFEED_PORT` overrides `server.port`
/// - `DOCFEED_DB_PATH` overrides `database.path`
/// - `DOCFEED_NOTIFY_PREFIX` overrides `notify.prefix`
/// - `DOCFEED_KEEPALIVE_SECS` overrides `stream.keepalive_secs`
/// - `DOCFEED_LOG_LEVEL` overrides `logging.level`
/// - `DOCFEED_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Parses a TOML configuration document.
///
/// # Errors
///
/// Returns `ConfigError::Parse` on malformed TOML or an invalid table name.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(contents)?)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("DOCFEED_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("DOCFEED_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("DOCFEED_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(prefix) = var("DOCFEED_NOTIFY_PREFIX") {
        config.notify.prefix = prefix;
    }
    if let Some(secs) = var("DOCFEED_KEEPALIVE_SECS") {
        if let Ok(parsed) = secs.parse() {
            config.stream.keepalive_secs = parsed;
        }
    }
    if let Some(level) = var("DOCFEED_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("DOCFEED_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
