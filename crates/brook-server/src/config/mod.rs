//! Broker configuration and limits.
//!
//! Supports configuration from:
//! - TOML file (default: `brook.toml`, a missing file is allowed)
//! - Environment variables with `BROOK__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `BROOK__SERVER__BIND=0.0.0.0:1884`
//! - `BROOK__LIMITS__MAX_PACKET_SIZE=2097152`
//! - `BROOK__MQTT__MAX_QOS=1`
//!
//! In-file substitution examples:
//! ```toml
//! [server]
//! bind = "${MQTT_HOST:-0.0.0.0}:${MQTT_PORT:-1883}"
//! ```

mod limits;
mod log;
mod mqtt;
mod persistence;
mod server;
mod session;

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use self::log::{LogConfig, LogLevel};
pub use limits::{LimitsConfig, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_TOPIC_LENGTH};
pub use mqtt::MqttConfig;
pub use persistence::{PersistenceConfig, DEFAULT_PERSISTENCE_PATH, DEFAULT_SYNC_INTERVAL_SECS};
pub use server::{ServerConfig, DEFAULT_MAX_CONNECTIONS};
pub use session::{SessionConfig, DEFAULT_MAX_KEEP_ALIVE};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Listener configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Session configuration.
    pub session: SessionConfig,
    /// MQTT feature configuration.
    pub mqtt: MqttConfig,
    /// Session store configuration.
    pub persistence: PersistenceConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `BROOK__` prefix with double underscores for nesting:
    ///    - `BROOK__SERVER__BIND=0.0.0.0:1884`
    ///    - `BROOK__PERSISTENCE__ENABLED=true`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("session.max_keep_alive", DEFAULT_MAX_KEEP_ALIVE as i64)?
            .set_default("session.max_queued_messages", 0)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.reflect", true)?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", DEFAULT_PERSISTENCE_PATH)?
            .set_default(
                "persistence.sync_interval_secs",
                DEFAULT_SYNC_INTERVAL_SECS as i64,
            )?;

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // Override with environment variables (BROOK__SERVER__BIND, etc.)
        let cfg = builder
            .add_source(
                Environment::with_prefix("BROOK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string. Environment overrides are not applied.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        self.persistence
            .validate()
            .map_err(ConfigError::Validation)?;
        Ok(())
    }
}
