//! Configuration management for the AListLite supervisor.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/alistlite/config.toml`.
//!
//! This is the supervisor's own configuration. The engine keeps its settings
//! in `config.json` inside the data directory; see [`crate::engine::config`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::DEFAULT_STOP_GRACE;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("startup_timeout_ms must be between 1000 and 600000, got {0}")]
    InvalidStartupTimeout(u64),

    #[error("shutdown_timeout_ms must be between 100 and 600000, got {0}")]
    InvalidShutdownTimeout(u64),

    #[error("update timeout_secs must be between 1 and 300, got {0}")]
    InvalidUpdateTimeout(u64),

    #[error("admin_password must not be blank")]
    BlankAdminPassword,

    #[error("mount_path must start with '/', got {0}")]
    InvalidMountPath(String),

    #[error("{field} must be an http:// or https:// URL, got {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
/// Extra time for bootstrap commands and socket round trips.
const LIFECYCLE_REQUEST_SLACK_SECS: u64 = 30;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Releases endpoint queried by the update checker.
pub const DEFAULT_UPDATE_ENDPOINT: &str =
    "https://api.github.com/repos/LeoHaoVIP/AListLiteAndroid/releases/latest";

/// Base URL of the download mirror.
pub const DEFAULT_MIRROR_BASE: &str = "https://pan.leohao.cn/d/LeoHao/files/share/APP/AListLite";

/// Main configuration structure for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General supervisor configuration.
    pub daemon: DaemonConfig,

    /// Engine process configuration.
    pub engine: EngineConfig,

    /// First-run setup applied once per data directory.
    pub bootstrap: BootstrapConfig,

    /// Release checking.
    pub update: UpdateConfig,
}

/// General supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the engine's data (config.json, database, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Start the engine as soon as the supervisor is up.
    pub autostart: bool,
}

/// Engine process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable. Bare names are resolved through `PATH`.
    pub binary: String,

    /// How long to wait for a listener to come up after spawning.
    pub startup_timeout_ms: u64,

    /// Default graceful shutdown budget before the process is killed.
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Local directory mounted as the default storage.
    pub storage_path: PathBuf,

    /// Mount point of the default storage inside the engine.
    pub mount_path: String,

    /// Initial admin password.
    pub admin_password: String,
}

/// Release checking configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Latest-release endpoint (GitHub releases API shape).
    pub endpoint: String,

    /// Download mirror base URL.
    pub mirror_base: String,

    /// Check for updates once when the supervisor starts.
    pub check_on_start: bool,

    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            autostart: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "alist".to_string(),
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            storage_path: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            mount_path: "/本地存储".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_UPDATE_ENDPOINT.to_string(),
            mirror_base: DEFAULT_MIRROR_BASE.to_string(),
            check_on_start: true,
            timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// How long a CLI client waits on a start or stop request. A start may
    /// first stop a stale engine, so two full stops fit in the budget.
    pub fn lifecycle_request_timeout(&self) -> Duration {
        let stop = self.shutdown_timeout().saturating_add(DEFAULT_STOP_GRACE);
        self.startup_timeout()
            .saturating_add(stop.saturating_mul(2))
            .saturating_add(Duration::from_secs(LIFECYCLE_REQUEST_SLACK_SECS))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alistlite")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alistlite")
        .join("data")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ALISTLITE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ALISTLITE_ENGINE_BIN: Override the engine executable
    /// - ALISTLITE_DATA_DIR: Override the engine data directory
    ///
    /// Runs before logging is configured, so the applied overrides are
    /// returned as `(variable, value)` pairs for the caller to log.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Some(level) = env_override("ALISTLITE_LOG_LEVEL") {
            self.daemon.log_level = level.clone();
            applied.push(("ALISTLITE_LOG_LEVEL", level));
        }

        if let Some(bin) = env_override("ALISTLITE_ENGINE_BIN") {
            self.engine.binary = bin.clone();
            applied.push(("ALISTLITE_ENGINE_BIN", bin));
        }

        if let Some(dir) = env_override("ALISTLITE_DATA_DIR") {
            self.daemon.data_dir = PathBuf::from(&dir);
            applied.push(("ALISTLITE_DATA_DIR", dir));
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let startup = self.engine.startup_timeout_ms;
        if !(1_000..=600_000).contains(&startup) {
            return Err(ConfigError::InvalidStartupTimeout(startup));
        }

        let shutdown = self.engine.shutdown_timeout_ms;
        if !(100..=600_000).contains(&shutdown) {
            return Err(ConfigError::InvalidShutdownTimeout(shutdown));
        }

        if !(1..=300).contains(&self.update.timeout_secs) {
            return Err(ConfigError::InvalidUpdateTimeout(self.update.timeout_secs));
        }

        if self.bootstrap.admin_password.trim().is_empty() {
            return Err(ConfigError::BlankAdminPassword);
        }

        if !self.bootstrap.mount_path.starts_with('/') {
            return Err(ConfigError::InvalidMountPath(
                self.bootstrap.mount_path.clone(),
            ));
        }

        check_http_url("update.endpoint", &self.update.endpoint)?;
        check_http_url("update.mirror_base", &self.update.mirror_base)?;

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Directory for supervisor-owned state (flags, logs).
    pub fn state_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("supervisor")
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn check_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
