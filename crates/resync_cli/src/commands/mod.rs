//! CLI command implementations.

pub mod clear;
pub mod inspect;
pub mod retry;

use resync_engine::{Clock, EngineConfig, RecordStore, SyncError, TokioClock};
use resync_storage::{FilePersistence, StorageError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// The record directory does not exist.
    #[error("no record directory at {0}")]
    Missing(PathBuf),

    /// The namespace or user is invalid, or a record is unreadable.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The directory could not be opened.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Writing output failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON output could not be produced.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The records a command operates on.
#[derive(Debug, Clone)]
pub struct Target {
    /// Record directory.
    pub path: PathBuf,
    /// Engine configuration naming the namespace and user.
    pub config: EngineConfig,
}

impl Target {
    /// Records of `user` in `namespace` under `path`.
    pub fn new(path: PathBuf, namespace: &str, user: &str) -> Self {
        Self {
            path,
            config: EngineConfig::new(namespace, user),
        }
    }

    /// Opens the directory and returns a store over the target's records.
    ///
    /// Never creates the directory.
    pub fn open(&self) -> Result<RecordStore, CliError> {
        if !self.path.is_dir() {
            return Err(CliError::Missing(self.path.clone()));
        }
        self.config.validate()?;
        let persistence = FilePersistence::open(&self.path)?;
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        Ok(RecordStore::new(&self.config, Arc::new(persistence), clock))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Target;
    use resync_engine::{Clock, RecordStore, TokioClock};
    use resync_storage::FilePersistence;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Writes `records` as (key, payload) Dirty records, failing `failed`.
    pub fn populated(records: &[(&str, &str)], failed: &[&str]) -> (TempDir, Target) {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().to_path_buf(), "lingo", "user-1");
        {
            let persistence = Arc::new(FilePersistence::open(dir.path()).unwrap());
            let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(1_000));
            let store = RecordStore::new(&target.config, persistence, clock);
            for (key, payload) in records {
                store.put(key, payload.as_bytes().to_vec()).unwrap();
            }
            for key in failed {
                let record = store.get(key).unwrap().unwrap();
                store
                    .record_failure(key, record.version, "rejected by remote: bad schema")
                    .unwrap();
                store
                    .mark_failed(key, record.version, "rejected by remote: bad schema")
                    .unwrap();
            }
        }
        (dir, target)
    }

    pub fn output(run: impl FnOnce(&mut Vec<u8>)) -> String {
        let mut out = Vec::new();
        run(&mut out);
        String::from_utf8(out).unwrap()
    }
}
