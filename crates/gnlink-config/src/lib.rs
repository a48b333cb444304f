#![deny(unsafe_code)]

//! Configuration loading and validation for gnlink.
//!
//! Reads a TOML file into [`AppConfig`]. Every section is optional and falls
//! back to its defaults, so an empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Smallest accepted MTU. Must hold the headers plus a few attributes.
pub const MIN_MTU: usize = 64;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings of the `echo_demo` family.
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Datagram transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest encoded frame, in bytes.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Port the responder binds to.
    #[serde(default)]
    pub responder_port: u32,

    /// Datagrams buffered per endpoint before senders wait.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            responder_port: 0,
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_mtu() -> usize {
    8192
}

fn default_queue_depth() -> usize {
    64
}

/// What a dump request does when another dump holds the session lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Contention {
    /// Wait for the lock.
    #[default]
    Block,
    /// Answer `-EBUSY` immediately.
    FailFast,
}

/// Stream session settings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub contention: Contention,

    /// Give up waiting for the session lock after this many milliseconds.
    /// `0` waits until shutdown.
    #[serde(default)]
    pub acquire_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `echo_demo` family settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of parts an `ECHO_DUMP` produces.
    #[serde(default = "default_dump_runs")]
    pub dump_runs: u32,

    /// Text carried by every dump part.
    #[serde(default = "default_dump_message")]
    pub dump_message: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            dump_runs: default_dump_runs(),
            dump_message: default_dump_message(),
        }
    }
}

fn default_dump_runs() -> u32 {
    3
}

fn default_dump_message() -> String {
    "you asked for a dump; this part comes from the echo_demo dump handler".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.mtu < MIN_MTU {
            return Err(ConfigError::Validation(format!(
                "transport.mtu must be at least {MIN_MTU}, got {}",
                self.transport.mtu
            )));
        }
        if self.transport.mtu > u32::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "transport.mtu must fit in 32 bits, got {}",
                self.transport.mtu
            )));
        }
        if self.transport.queue_depth == 0 {
            return Err(ConfigError::Validation(
                "transport.queue_depth must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        if self.demo.dump_message.contains('\0') {
            return Err(ConfigError::Validation(
                "demo.dump_message must not contain NUL bytes".to_string(),
            ));
        }

        Ok(())
    }
}
