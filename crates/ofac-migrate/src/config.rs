//! Configuration loading from file and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use ofac_db::{ConnectOptions, ConnectionConfig};
use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the SQLite database file.
    #[serde(default = "default_db_dir")]
    pub dir: PathBuf,

    /// Database name; the file is `<dir>/<name>.db`.
    #[serde(default = "default_db_name")]
    pub name: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Seconds to wait for a working connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "ofac_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_db_name() -> String {
    "ofac".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    ConnectOptions::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    ConnectOptions::default().pool_max_size
}

fn default_connect_timeout_secs() -> u64 {
    ofac_db::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: default_db_dir(),
            name: default_db_name(),
            user: String::new(),
            password: String::new(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
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

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("pool_max_size", &self.pool_max_size)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.dir, &self.name)
            .with_credentials(&self.user, &self.password)
            .with_options(ConnectOptions {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                busy_timeout_ms: self.busy_timeout_ms,
                pool_max_size: self.pool_max_size,
            })
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

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `OFAC_DB_DIR` overrides `database.dir`
/// - `OFAC_DB_NAME` overrides `database.name`
/// - `OFAC_DB_USER` / `OFAC_DB_PASSWORD` override the credentials
/// - `OFAC_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `OFAC_DB_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `OFAC_DB_CONNECT_TIMEOUT_SECS` overrides `database.connect_timeout_secs`
/// - `OFAC_LOG_LEVEL` overrides `logging.level`
/// - `OFAC_LOG_JSON` overrides `logging.json` (set to "true" to enable)
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

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = lookup("OFAC_DB_DIR") {
        config.database.dir = PathBuf::from(dir);
    }
    if let Some(name) = lookup("OFAC_DB_NAME") {
        config.database.name = name;
    }
    if let Some(user) = lookup("OFAC_DB_USER") {
        config.database.user = user;
    }
    if let Some(password) = lookup("OFAC_DB_PASSWORD") {
        config.database.password = password;
    }
    if let Some(parsed) = lookup("OFAC_DB_BUSY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.database.busy_timeout_ms = parsed;
    }
    if let Some(parsed) = lookup("OFAC_DB_POOL_MAX_SIZE").and_then(|v| v.parse().ok()) {
        config.database.pool_max_size = parsed;
    }
    if let Some(parsed) = lookup("OFAC_DB_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.database.connect_timeout_secs = parsed;
    }
    if let Some(level) = lookup("OFAC_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("OFAC_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
