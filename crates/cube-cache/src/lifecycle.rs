//! Persistence Lifecycle
//!
//! Lazy persistence: the store is read from disk once at startup and written
//! once at graceful shutdown. Nothing is kept in sync in between.

use crate::cache::CubeCacheStore;
use crate::invalidation::InvalidationCheckpoint;
use crate::snapshot::{read_snapshot, write_snapshot, CacheSnapshot};
use cube_core::{unix_millis, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// The `persistence` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("cube_cache.snapshot"),
        }
    }
}

impl PersistenceConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }
}

#[derive(Debug)]
pub struct PersistenceLifecycle {
    config: PersistenceConfig,
    /// Unix millis of the last successful write, 0 if none
    last_persist_ts: AtomicU64,
}

impl PersistenceLifecycle {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            last_persist_ts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn last_persist_ts(&self) -> Option<u64> {
        match self.last_persist_ts.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Load the snapshot into `store`, returning its invalidation checkpoint.
    ///
    /// A missing, unreadable or corrupt snapshot is logged and the store is
    /// left empty; startup always continues.
    pub fn restore(&self, store: &CubeCacheStore) -> Option<InvalidationCheckpoint> {
        if !self.config.enabled {
            return None;
        }

        let path = &self.config.path;
        if !path.exists() {
            info!(path = %path.display(), "No cache snapshot found, starting empty");
            return None;
        }

        match read_snapshot(path) {
            Ok(snapshot) => {
                let checkpoint = snapshot.checkpoint.clone();
                let total = snapshot.entries.len();
                let loaded = store.restore(snapshot.into_entries());
                info!(
                    path = %path.display(),
                    loaded,
                    skipped = total - loaded.min(total),
                    "Restored cache snapshot"
                );
                checkpoint
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unusable cache snapshot");
                None
            }
        }
    }

    /// Write the store and checkpoint to disk, overwriting any earlier file
    pub fn persist(
        &self,
        store: &CubeCacheStore,
        checkpoint: Option<InvalidationCheckpoint>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let snapshot = CacheSnapshot::capture(store, checkpoint);
        let entries = snapshot.entries.len();
        write_snapshot(&self.config.path, &snapshot)?;

        self.last_persist_ts.store(unix_millis(), Ordering::Relaxed);
        info!(path = %self.config.path.display(), entries, "Persisted cache snapshot");
        Ok(())
    }
}
