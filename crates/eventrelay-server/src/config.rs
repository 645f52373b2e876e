// ABOUTME: Configuration loading for the eventrelay server: process settings from environment variables.
// ABOUTME: Per-environment store, queue, and background loop settings come from a YAML file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eventrelay_core::{MergeError, MergeSchema};
use eventrelay_store::QueueOptions;
use serde::Deserialize;
use thiserror::Error;

const MB: u64 = 1024 * 1024;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("EVENTRELAY_BIND is not a valid socket address: {0}")]
    InvalidBind(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid environments file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid merge schema for environment {env}: {source}")]
    Schema {
        env: String,
        #[source]
        source: MergeError,
    },

    #[error("{0} declares no environments")]
    NoEnvironments(PathBuf),
}

/// Process-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub home: PathBuf,
    pub bind: SocketAddr,
    pub environments_file: PathBuf,
}

impl RelayConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - EVENTRELAY_HOME: data directory (default: ~/.eventrelay)
    /// - EVENTRELAY_BIND: socket address to bind (default: 127.0.0.1:7440)
    /// - EVENTRELAY_ENVIRONMENTS: environments file (default: $EVENTRELAY_HOME/environments.yaml)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("EVENTRELAY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        let bind_str =
            std::env::var("EVENTRELAY_BIND").unwrap_or_else(|_| default_bind().to_string());
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|_| ConfigError::InvalidBind(bind_str))?;

        let environments_file = std::env::var("EVENTRELAY_ENVIRONMENTS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("environments.yaml"));

        Ok(Self {
            home,
            bind,
            environments_file,
        })
    }

    /// Read and parse the environments file.
    pub fn load_environments(&self) -> Result<EnvironmentsFile, ConfigError> {
        EnvironmentsFile::load(&self.environments_file)
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".eventrelay")
}

fn default_bind() -> &'static str {
    "127.0.0.1:7440"
}

/// The parsed environments file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentsFile {
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Directory relative schema paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl EnvironmentsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file = Self::parse(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        if file.environments.is_empty() {
            return Err(ConfigError::NoEnvironments(path.to_path_buf()));
        }
        file.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(file)
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Settings for one environment namespace.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    /// Merge schema document (JSON). Without one every field is overwritten.
    #[serde(default)]
    pub event_schema: Option<PathBuf>,
    #[serde(default)]
    pub delta_store: DeltaStoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub forwarder: Option<ForwarderConfig>,
    #[serde(default)]
    pub stale_watch: Option<StaleWatchConfig>,
}

impl EnvironmentConfig {
    /// Load the merge schema, resolving a relative path against `base_dir`.
    pub fn schema(&self, env: &str, base_dir: &Path) -> Result<MergeSchema, ConfigError> {
        let Some(path) = &self.event_schema else {
            return Ok(MergeSchema::new());
        };
        let path = if path.is_relative() {
            base_dir.join(path)
        } else {
            path.clone()
        };
        MergeSchema::from_path(&path).map_err(|source| ConfigError::Schema {
            env: env.to_string(),
            source,
        })
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            name: self.queue.name.clone(),
            max_size: self.queue.max_size_mb.saturating_mul(MB),
            compression: self.queue.compression,
        }
    }

    pub fn delta_store_max_size(&self) -> u64 {
        self.delta_store.max_size_mb.saturating_mul(MB)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeltaStoreConfig {
    #[serde(default = "default_delta_store_max_size_mb")]
    pub max_size_mb: u64,
}

impl Default for DeltaStoreConfig {
    fn default() -> Self {
        Self {
            max_size_mb: default_delta_store_max_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_queue_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default)]
    pub compression: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_size_mb: default_queue_max_size_mb(),
            compression: false,
        }
    }
}

/// Settings of the loop that forwards queued status updates downstream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ForwarderConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl ForwarderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_items: default_max_items(),
        }
    }
}

/// Settings of the loop that retires events nobody opened a ticket for.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StaleWatchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl StaleWatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for StaleWatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_delta_store_max_size_mb() -> u64 {
    1024
}

fn default_queue_name() -> String {
    eventrelay_store::queue::DEFAULT_QUEUE_NAME.to_string()
}

fn default_queue_max_size_mb() -> u64 {
    eventrelay_store::queue::DEFAULT_QUEUE_MAX_SIZE / MB
}

fn default_interval_secs() -> u64 {
    60
}

fn default_max_items() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    300
}
