//! Configuration module.
//!
//! Loads a TOML file, overlaid with `PRTG_POLLER_*` environment variables,
//! and validates it once at startup into a [`PollerConfig`].
//!
//! ```toml
//! [storage]
//! mode = "database"
//! path = "prtg_poller.db"
//!
//! [endpoints.core-dc]
//! host = "10.0.0.5"
//! scheme = "https"
//! ignore_ssl_errors = true
//! use_api_token = true
//! api_token = "..."
//! refresh_interval_seconds = 30
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::db::{Credentials, EndpointDescriptor, Scheme, DEFAULT_MAX_UNITS};
use crate::scheduler::{OverlapPolicy, SchedulerSettings, MAX_INTERVAL};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PRTG_POLLER_CONFIG";
const ENV_PREFIX: &str = "PRTG_POLLER_";
const DEFAULT_CONFIG_PATHS: &[&str] = &["/app/config/config.toml", "config.toml"];

const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DB_PATH: &str = "prtg_poller.db";
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Configuration errors. Every one of them is fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration file found (tried {0})")]
    NotFound(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("endpoint {alias}: {reason}")]
    InvalidEndpoint { alias: String, reason: String },
    #[error("invalid storage settings: {0}")]
    InvalidStorage(String),
    #[error("invalid scheduler settings: {0}")]
    InvalidScheduler(String),
}

/// Where poll results go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// Replace-set policy in a SQLite database.
    Database { path: PathBuf },
    /// Bounded-archive policy in a directory of JSON units.
    Archive {
        output_dir: PathBuf,
        max_units_per_alias: usize,
    },
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub endpoints: Vec<EndpointDescriptor>,
    pub storage: StorageTarget,
    pub scheduler: SchedulerSettings,
    pub fetch_timeout: Duration,
    pub persist_timeout: Duration,
    pub drain_timeout: Duration,
}

impl PollerConfig {
    /// Load from `PRTG_POLLER_CONFIG`, or the first default path that exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = locate_config()?;
        tracing::info!("Loading configuration from {}", path.display());
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let raw: RawConfig = figment
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.validate()
    }
}

fn locate_config() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    endpoints: BTreeMap<String, RawEndpoint>,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    scheduler: RawScheduler,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    #[serde(alias = "server_ip")]
    host: Option<String>,
    port: Option<u16>,
    #[serde(default, alias = "protocol")]
    scheme: Scheme,
    #[serde(default)]
    ignore_ssl_errors: bool,
    #[serde(default)]
    use_api_token: bool,
    api_token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "default_interval")]
    refresh_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum RawStorage {
    Database {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
    Archive {
        output_dir: PathBuf,
        #[serde(default = "default_max_units")]
        max_files_per_alias: usize,
    },
}

impl Default for RawStorage {
    fn default() -> Self {
        RawStorage::Database {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawScheduler {
    tick_ms: u64,
    fetch_timeout_secs: u64,
    persist_timeout_secs: u64,
    drain_timeout_secs: u64,
    run_on_start: bool,
    overlap: OverlapPolicy,
}

impl Default for RawScheduler {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            fetch_timeout_secs: 15,
            persist_timeout_secs: 30,
            drain_timeout_secs: 30,
            run_on_start: true,
            overlap: OverlapPolicy::Skip,
        }
    }
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_max_units() -> usize {
    DEFAULT_MAX_UNITS
}

/// Returns the trimmed value if present and non-blank.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RawConfig {
    fn validate(self) -> Result<PollerConfig, ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let endpoints = self
            .endpoints
            .into_iter()
            .map(|(alias, raw)| raw.validate(alias))
            .collect::<Result<Vec<_>, _>>()?;

        let storage = match self.storage {
            RawStorage::Database { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidStorage("database path is empty".into()));
                }
                StorageTarget::Database { path }
            }
            RawStorage::Archive {
                output_dir,
                max_files_per_alias,
            } => {
                if output_dir.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidStorage("output_dir is empty".into()));
                }
                if max_files_per_alias == 0 {
                    return Err(ConfigError::InvalidStorage(
                        "max_files_per_alias must be at least 1".into(),
                    ));
                }
                StorageTarget::Archive {
                    output_dir,
                    max_units_per_alias: max_files_per_alias,
                }
            }
        };

        let s = self.scheduler;
        if !(1..=1000).contains(&s.tick_ms) {
            return Err(ConfigError::InvalidScheduler(format!(
                "tick_ms must be between 1 and 1000, got {}",
                s.tick_ms
            )));
        }
        let timeouts = [s.fetch_timeout_secs, s.persist_timeout_secs, s.drain_timeout_secs];
        if timeouts.iter().any(|t| !(1..=MAX_TIMEOUT_SECS).contains(t)) {
            return Err(ConfigError::InvalidScheduler(format!(
                "timeouts must be between 1 and {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }

        Ok(PollerConfig {
            endpoints,
            storage,
            scheduler: SchedulerSettings {
                tick: Duration::from_millis(s.tick_ms),
                run_on_start: s.run_on_start,
                overlap: s.overlap,
            },
            fetch_timeout: Duration::from_secs(s.fetch_timeout_secs),
            persist_timeout: Duration::from_secs(s.persist_timeout_secs),
            drain_timeout: Duration::from_secs(s.drain_timeout_secs),
        })
    }
}

impl RawEndpoint {
    fn validate(self, alias: String) -> Result<EndpointDescriptor, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            alias: alias.clone(),
            reason: reason.to_string(),
        };

        if alias.trim().is_empty() {
            return Err(invalid("alias is empty"));
        }
        // Aliases name archive files.
        if alias.starts_with('.') || alias.contains(|c| c == '/' || c == '\\') {
            return Err(invalid("alias must not start with '.' or contain path separators"));
        }

        let host = non_blank(self.host).ok_or_else(|| invalid("host is required"))?;

        if self.refresh_interval_seconds == 0
            || self.refresh_interval_seconds > MAX_INTERVAL.as_secs()
        {
            return Err(invalid("refresh_interval_seconds must be between 1 and 31622400"));
        }

        let credentials = if self.use_api_token {
            let token = non_blank(self.api_token)
                .ok_or_else(|| invalid("use_api_token is set but api_token is missing"))?;
            Credentials::Token(token)
        } else {
            let username =
                non_blank(self.username).ok_or_else(|| invalid("username is required"))?;
            let password = self
                .password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| invalid("password is required"))?;
            Credentials::Password { username, password }
        };

        Ok(EndpointDescriptor {
            port: self.port.unwrap_or_else(|| self.scheme.default_port()),
            alias,
            host,
            scheme: self.scheme,
            credentials,
            verify_tls: !self.ignore_ssl_errors,
            interval: Duration::from_secs(self.refresh_interval_seconds),
        })
    }
}
