//! Configuration Module
//!
//! Provides TOML-based configuration for the connection handler with
//! support for:
//! - Logging level
//! - Connection state machine waits
//! - Catch-up gating flag
//! - Environment variable overrides (OPSYNC__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::handler::{DEFAULT_LEAVE_WAIT, JOIN_OP_TIMEOUT};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
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

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Flag consulted by the handler factory to decide on catch-up gating
pub const CATCH_UP_BEFORE_DECLARING_CONNECTED: &str = "catch_up_before_declaring_connected";

/// Boolean feature-flag lookup
///
/// Hosts with their own configuration systems implement this directly;
/// [`Config`] implements it over the `[connection]` section.
pub trait ConfigProvider: Send + Sync {
    /// Look up a boolean flag by name; `None` when the flag is unset
    fn get_bool(&self, key: &str) -> Option<bool>;
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Connection state machine configuration
    pub connection: ConnectionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Connection state machine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a write connection may wait for its Join op before the
    /// NoJoinOp diagnostic fires (e.g. "45s")
    #[serde(with = "humantime_serde")]
    pub join_op_timeout: Duration,
    /// How long a reconnect may wait for the previous client's Leave op
    /// before promoting anyway (e.g. "5m")
    #[serde(with = "humantime_serde")]
    pub max_client_leave_wait: Duration,
    /// Hold the Connected notification until the delta stream has processed
    /// every op known at connect time
    pub catch_up_before_declaring_connected: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            join_op_timeout: JOIN_OP_TIMEOUT,
            max_client_leave_wait: DEFAULT_LEAVE_WAIT,
            catch_up_before_declaring_connected: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `OPSYNC__` prefix with double underscores for nesting:
    ///    - `OPSYNC__LOG__LEVEL=debug` overrides `log.level`
    ///    - `OPSYNC__CONNECTION__JOIN_OP_TIMEOUT=30s` overrides `connection.join_op_timeout`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("connection.join_op_timeout", "45s")?
            .set_default("connection.max_client_leave_wait", "5m")?
            .set_default("connection.catch_up_before_declaring_connected", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (OPSYNC__CONNECTION__..., etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("OPSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.join_op_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connection.join_op_timeout must be positive".to_string(),
            ));
        }
        if self.connection.max_client_leave_wait.is_zero() {
            return Err(ConfigError::Validation(
                "connection.max_client_leave_wait must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigProvider for Config {
    fn get_bool(&self, key: &str) -> Option<bool> {
        match key {
            CATCH_UP_BEFORE_DECLARING_CONNECTED => {
                Some(self.connection.catch_up_before_declaring_connected)
            }
            _ => None,
        }
    }
}
