// ABOUTME: Owns the eventrelay home directory layout and opens per-environment stores inside it.
// ABOUTME: Each environment gets its own delta store file and its own queue file.

use std::fs;
use std::path::{Path, PathBuf};

use eventrelay_core::{Hashed, MergeSchema};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::delta_store::{DeltaStore, DeltaStoreError};
use crate::queue::{QueueError, QueueOptions};
use crate::task_queue::TaskQueue;

/// Errors that can occur during storage management operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid environment name: {0:?}")]
    InvalidEnvironment(String),

    #[error("delta store error: {0}")]
    DeltaStore(#[from] DeltaStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Manages the eventrelay home directory:
///
/// ```text
/// <home>/deltas/<env>.db
/// <home>/queues/<env>/<queue name>.db
/// ```
pub struct StorageManager {
    home: PathBuf,
}

impl StorageManager {
    /// Create a StorageManager rooted at `home`, creating the directory tree
    /// if it does not exist.
    pub fn new(home: PathBuf) -> Result<Self, ManagerError> {
        fs::create_dir_all(home.join("deltas"))?;
        fs::create_dir_all(home.join("queues"))?;
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Path of an environment's delta store file (not created).
    pub fn delta_store_path(&self, env: &str) -> Result<PathBuf, ManagerError> {
        validate_env(env)?;
        Ok(self.home.join("deltas").join(format!("{env}.db")))
    }

    /// Path of an environment's queue file. Creates the environment's queue
    /// directory.
    pub fn queue_path(&self, env: &str, queue_name: &str) -> Result<PathBuf, ManagerError> {
        validate_env(env)?;
        validate_env(queue_name)?;
        let dir = self.home.join("queues").join(env);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{queue_name}.db")))
    }

    pub fn open_delta_store(
        &self,
        env: &str,
        max_size: u64,
        schema: MergeSchema,
    ) -> Result<DeltaStore, ManagerError> {
        let path = self.delta_store_path(env)?;
        let span = tracing::info_span!("delta_store", env = %env);
        let store = DeltaStore::open(&path, max_size, schema)?.with_span(span);
        tracing::info!("opened delta store for {} at {}", env, path.display());
        Ok(store)
    }

    pub fn open_task_queue<T>(
        &self,
        env: &str,
        options: QueueOptions,
    ) -> Result<TaskQueue<T>, ManagerError>
    where
        T: Hashed + Serialize + DeserializeOwned,
    {
        let path = self.queue_path(env, &options.name)?;
        let span = tracing::info_span!("queue", env = %env, name = %options.name);
        let queue = TaskQueue::open(&path, options)?.with_span(span);
        tracing::info!("opened queue for {} at {}", env, path.display());
        Ok(queue)
    }

    /// Environments that have a delta store on disk, sorted by name.
    pub fn list_environments(&self) -> Result<Vec<String>, ManagerError> {
        let mut envs = Vec::new();
        for entry in fs::read_dir(self.home.join("deltas"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match validate_env(stem) {
                Ok(()) => envs.push(stem.to_string()),
                Err(_) => tracing::warn!("skipping unexpected file in deltas/: {}", path.display()),
            }
        }
        envs.sort();
        Ok(envs)
    }
}

/// Environment and queue names become file names, so keep them to a safe
/// alphabet.
fn validate_env(name: &str) -> Result<(), ManagerError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ManagerError::InvalidEnvironment(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay_core::StatusUpdate;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn storage_manager_creates_directories() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("relay_home");

        let mgr = StorageManager::new(home.clone()).unwrap();

        assert!(home.join("deltas").exists());
        assert!(home.join("queues").exists());
        assert_eq!(mgr.home(), &home);
    }

    #[test]
    fn rejects_path_like_environment_names() {
        let dir = TempDir::new().unwrap();
        let mgr = StorageManager::new(dir.path().to_path_buf()).unwrap();

        for bad in ["", "../etc", "a/b", "a b"] {
            assert!(
                matches!(mgr.delta_store_path(bad), Err(ManagerError::InvalidEnvironment(_))),
                "accepted {bad:?}"
            );
        }
        assert!(mgr.delta_store_path("prod-eu_1").is_ok());
    }

    #[tokio::test]
    async fn opens_stores_per_environment() {
        let dir = TempDir::new().unwrap();
        let mgr = StorageManager::new(dir.path().to_path_buf()).unwrap();

        let events = mgr
            .open_delta_store("prod", 1 << 20, MergeSchema::new())
            .unwrap();
        let queue: TaskQueue<StatusUpdate> =
            mgr.open_task_queue("prod", QueueOptions::default()).unwrap();
        mgr.open_delta_store("staging", 1 << 20, MergeSchema::new())
            .unwrap();

        events.append("E1", &json!({"a": 1})).await.unwrap();
        queue.put(&StatusUpdate::new("E1", "New")).await.unwrap();

        assert!(dir.path().join("deltas").join("prod.db").exists());
        assert!(dir.path().join("queues").join("prod").join("queue.db").exists());
        assert_eq!(
            mgr.list_environments().unwrap(),
            vec!["prod".to_string(), "staging".to_string()]
        );
    }
}
