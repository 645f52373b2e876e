// ABOUTME: Shared application state for the eventrelay HTTP server and background loops.
// ABOUTME: Holds one delta store and one task queue per configured environment namespace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eventrelay_core::StatusUpdate;
use eventrelay_store::{DeltaStore, ManagerError, StorageManager, TaskQueue};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, EnvironmentConfig, EnvironmentsFile, ForwarderConfig, StaleWatchConfig};
use crate::forwarder::{StatusSink, spawn_forwarder};
use crate::watcher::spawn_stale_watcher;

/// Errors that can occur while opening the stores of every environment.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] ManagerError),
}

/// The stores and loop settings of one environment namespace.
#[derive(Clone)]
pub struct Environment {
    pub name: String,
    pub events: Arc<DeltaStore>,
    pub queue: Arc<TaskQueue<StatusUpdate>>,
    pub forwarder: Option<ForwarderConfig>,
    pub stale_watch: Option<StaleWatchConfig>,
}

impl Environment {
    /// Open (or create) the environment's delta store and queue.
    pub fn open(
        manager: &StorageManager,
        name: &str,
        config: &EnvironmentConfig,
        base_dir: &Path,
    ) -> Result<Self, StartupError> {
        let schema = config.schema(name, base_dir)?;
        let events = manager.open_delta_store(name, config.delta_store_max_size(), schema)?;
        let queue = manager.open_task_queue(name, config.queue_options())?;

        Ok(Self {
            name: name.to_string(),
            events: Arc::new(events),
            queue: Arc::new(queue),
            forwarder: config.forwarder.clone(),
            stale_watch: config.stale_watch.clone(),
        })
    }

    /// Flush and release both stores. Errors are logged, not returned.
    pub async fn close(&self) {
        if let Err(e) = self.events.close().await {
            tracing::error!("failed to close delta store of {}: {}", self.name, e);
        }
        if let Err(e) = self.queue.close().await {
            tracing::error!("failed to close queue of {}: {}", self.name, e);
        }
    }
}

/// Shared application state accessible by all Axum handlers.
/// The environment map is fixed at startup.
pub struct AppState {
    pub environments: BTreeMap<String, Environment>,
    pub home: PathBuf,
}

/// Type alias for the Arc-wrapped state used with Axum's State extractor.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Create an AppState with no environments.
    pub fn new(home: PathBuf) -> Self {
        Self {
            environments: BTreeMap::new(),
            home,
        }
    }

    /// Open every environment declared in `file` under the manager's home.
    pub fn open(manager: &StorageManager, file: &EnvironmentsFile) -> Result<Self, StartupError> {
        let mut state = Self::new(manager.home().to_path_buf());
        for (name, config) in &file.environments {
            let env = Environment::open(manager, name, config, &file.base_dir)?;
            state.insert(env);
        }
        Ok(state)
    }

    pub fn insert(&mut self, env: Environment) {
        self.environments.insert(env.name.clone(), env);
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.get(name)
    }

    /// Start the forwarder and stale watcher of every environment that
    /// configures them. All loops stop when `shutdown` flips to true.
    pub fn spawn_background(
        &self,
        sink: Arc<dyn StatusSink>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for env in self.environments.values() {
            if let Some(config) = &env.forwarder {
                handles.push(spawn_forwarder(
                    env.clone(),
                    Arc::clone(&sink),
                    config.clone(),
                    shutdown.clone(),
                ));
            }
            if let Some(config) = &env.stale_watch {
                handles.push(spawn_stale_watcher(env.clone(), config.clone(), shutdown.clone()));
            }
        }
        handles
    }

    pub async fn close(&self) {
        for env in self.environments.values() {
            env.close().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Open a state with a single environment named `env` in a temp dir.
    pub fn state_with(env: &str, config: EnvironmentConfig) -> (TempDir, SharedState) {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::new(dir.path().to_path_buf()).unwrap();
        let mut state = AppState::new(dir.path().to_path_buf());
        state.insert(Environment::open(&manager, env, &config, dir.path()).unwrap());
        (dir, Arc::new(state))
    }
}
