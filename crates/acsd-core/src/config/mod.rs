//! Configuration parsing and management.
//!
//! This module handles parsing of the acsd configuration file (TOML) that
//! defines the ACS credential list, the authentication realm, nonce cache
//! policy, and daemon settings.
//!
//! Configuration is loaded once at process start and passed to components by
//! value; nothing re-reads the file per request.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level acsd configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AcsConfig {
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Task lifecycle configuration.
    #[serde(default)]
    pub tasks: TaskConfig,

    /// ACS credential pairs.
    ///
    /// Multiple pairs may be valid concurrently to support credential
    /// migration: devices still presenting the old pair keep authenticating
    /// while the fleet is rolled over to the new one.
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

impl AcsConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - No credential pair is configured
    /// - A credential pair has an empty username or password
    /// - The nonce TTL is zero
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parsed configuration.
    ///
    /// Validation is fail-closed: a configuration that would misbehave at
    /// request time is rejected at load time instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[credentials]] entry is required".to_string(),
            ));
        }
        for (i, entry) in self.credentials.iter().enumerate() {
            if entry.username.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "credentials[{i}]: username must not be empty"
                )));
            }
            if entry.password.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "credentials[{i}] ({}): password must not be empty",
                    entry.username
                )));
            }
        }
        if self.auth.realm.is_empty()
            || !self
                .auth
                .realm
                .chars()
                .all(|c| c.is_ascii_graphic() || c == ' ')
            || self.auth.realm.contains('"')
        {
            // The realm is embedded in a quoted HTTP header value
            return Err(ConfigError::Validation(
                "auth.realm must be non-empty printable ASCII without '\"'".to_string(),
            ));
        }
        if self.auth.nonce_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.nonce_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.tasks.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "tasks.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the CWMP listener binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path to the SQLite task database.
    ///
    /// When absent, tasks are kept in memory only and are lost on restart.
    #[serde(default)]
    pub task_db: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            task_db: None,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Realm emitted in both challenge headers.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Nonce lifetime in seconds.
    ///
    /// A challenge nonce is valid for this long after issuance regardless of
    /// whether it is used. The default of 300 seconds tolerates real-world
    /// device and network latency between challenge and response while
    /// bounding cache growth.
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,

    /// Consume a nonce on successful digest validation.
    ///
    /// Off by default: field CPE firmware reuses the last nonce across
    /// retries within one session, so records stay valid until natural TTL
    /// expiry. Turning this on makes each nonce single-use.
    #[serde(default)]
    pub single_use_nonces: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            single_use_nonces: false,
        }
    }
}

/// Task lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Interval between timeout sweeps, in seconds.
    ///
    /// The sweep transition itself is a compare-and-swap, so the interval
    /// only affects how quickly an overdue task is detected, never
    /// correctness.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// One ACS credential pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Username the device presents.
    pub username: String,

    /// Password the device presents.
    pub password: String,
}

impl std::fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn default_listen() -> SocketAddr {
    // 7547 is the IANA-assigned CWMP port
    SocketAddr::from(([0, 0, 0, 0], 7547))
}

fn default_realm() -> String {
    "TR-069 ACS".to_string()
}

const fn default_nonce_ttl_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    30
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration is structurally valid but semantically wrong.
    #[error("invalid config: {0}")]
    Validation(String),
}
