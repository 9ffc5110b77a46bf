//! Configuration management for kvcoord
//!
//! Settings come from defaults, a TOML file, or `KVCOORD_<SECTION>_<KEY>`
//! environment variables, and are validated before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use humantime_serde::re::humantime;

use crate::backoff::BackoffConfig;
use crate::logging::{LogConfig, LogLevel};

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Longest lease TTL accepted by `validate`
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// CAS and watch behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// CAS attempts before giving up
    pub max_retries: u32,

    /// TTL of leases attached by the lease-aware client; `None` writes without a lease
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Option<Duration>,

    /// Pacing between lease-aware CAS attempts (its `max_retries` is ignored)
    pub cas_backoff: BackoffConfig,

    /// Pacing of watch reconnects; `max_retries = 0` reconnects forever
    pub watch_backoff: BackoffConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            lease_ttl: None,
            cas_backoff: BackoffConfig::new(Duration::from_millis(10), Duration::from_secs(1)),
            watch_backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Builder: set the CAS attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: attach leases with this TTL
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Builder: set CAS backoff
    pub fn with_cas_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.cas_backoff = backoff;
        self
    }

    /// Builder: set watch reconnect backoff
    pub fn with_watch_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.watch_backoff = backoff;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if let Some(ttl) = self.lease_ttl {
            if ttl < Duration::from_secs(1) || ttl > MAX_LEASE_TTL {
                return Err(ConfigError::ValidationFailed(format!(
                    "lease_ttl must be between 1s and {:?}, got {:?}",
                    MAX_LEASE_TTL, ttl
                )));
            }
        }

        self.cas_backoff
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(format!("cas_backoff: {}", e)))?;
        self.watch_backoff
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(format!("watch_backoff: {}", e)))?;

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Convert to the logging subsystem's config
    pub fn to_log_config(&self) -> Result<LogConfig, ConfigError> {
        let level: LogLevel = self.level.parse().map_err(|e| ConfigError::invalid("level", e))?;
        Ok(LogConfig::new(level)
            .with_timestamp(self.with_timestamp)
            .with_target(self.with_target)
            .json_format(self.json_format))
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| ConfigError::invalid(key, e))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw).map_err(|e| ConfigError::invalid(key, e))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: KVCOORD_<SECTION>_<KEY>
    /// Example: KVCOORD_CLIENT_LEASE_TTL=30s, KVCOORD_CLIENT_CAS_MAX_DELAY=500ms
    ///
    /// Logging uses the shorter KVCOORD_LOG_LEVEL and KVCOORD_LOG_JSON.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Client config
        if let Some(v) = lookup("KVCOORD_CLIENT_MAX_RETRIES") {
            config.client.max_retries = parse_var("KVCOORD_CLIENT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("KVCOORD_CLIENT_LEASE_TTL") {
            config.client.lease_ttl = if v.is_empty() || v == "none" {
                None
            } else {
                Some(parse_duration("KVCOORD_CLIENT_LEASE_TTL", &v)?)
            };
        }

        // CAS backoff config
        if let Some(v) = lookup("KVCOORD_CLIENT_CAS_MIN_DELAY") {
            config.client.cas_backoff.min_delay =
                parse_duration("KVCOORD_CLIENT_CAS_MIN_DELAY", &v)?;
        }
        if let Some(v) = lookup("KVCOORD_CLIENT_CAS_MAX_DELAY") {
            config.client.cas_backoff.max_delay =
                parse_duration("KVCOORD_CLIENT_CAS_MAX_DELAY", &v)?;
        }

        // Watch backoff config
        if let Some(v) = lookup("KVCOORD_CLIENT_WATCH_MIN_DELAY") {
            config.client.watch_backoff.min_delay =
                parse_duration("KVCOORD_CLIENT_WATCH_MIN_DELAY", &v)?;
        }
        if let Some(v) = lookup("KVCOORD_CLIENT_WATCH_MAX_DELAY") {
            config.client.watch_backoff.max_delay =
                parse_duration("KVCOORD_CLIENT_WATCH_MAX_DELAY", &v)?;
        }
        if let Some(v) = lookup("KVCOORD_CLIENT_WATCH_MAX_RETRIES") {
            config.client.watch_backoff.max_retries =
                parse_var("KVCOORD_CLIENT_WATCH_MAX_RETRIES", &v)?;
        }

        // Logging config
        if let Some(level) = lookup("KVCOORD_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(v) = lookup("KVCOORD_LOG_JSON") {
            config.logging.json_format = parse_var("KVCOORD_LOG_JSON", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
