//! Service wiring
//!
//! `CubeService` owns one instance of every cache component and is the only
//! thing an API or CLI layer needs to hold.

use crate::manager::{HypercubeManager, Resolution};
use arrow::record_batch::RecordBatch;
use cube_cache::{
    CacheConfig, CacheInvalidator, CubeCacheStore, InvalidatorConfig, PersistenceConfig,
    PersistenceLifecycle,
};
use cube_core::{Result, SourceSystem};
use cube_parser::{AggregationRequest, ClassifierConfig, CubeParams, QueryClassifier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Every configuration section of the proxy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub hypercube: ClassifierConfig,
    pub invalidator: InvalidatorConfig,
    pub persistence: PersistenceConfig,
}

/// Snapshot of the cache counters and persistence state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CubeMetrics {
    pub tables_cached: usize,
    pub total_rows: usize,
    pub cache_keys: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rollup_hits: u64,
    pub evictions: u64,
    /// Unix millis of the last snapshot written by this process
    pub last_persist_ts: Option<u64>,
    pub persistent_enabled: bool,
    pub persistent_path: PathBuf,
}

/// Health check answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ping {
    pub status: String,
    pub cache_size: usize,
}

/// The proxy: classifier, store, manager, invalidator and persistence wired together
pub struct CubeService {
    classifier: QueryClassifier,
    store: Arc<CubeCacheStore>,
    manager: HypercubeManager,
    invalidator: Arc<CacheInvalidator>,
    persistence: PersistenceLifecycle,
    shutdown_tx: broadcast::Sender<()>,
    invalidator_task: Mutex<Option<JoinHandle<()>>>,
}

impl CubeService {
    /// Build the service; nothing runs until [`start`](Self::start)
    pub fn new(config: ServiceConfig, source: Arc<dyn SourceSystem>) -> Self {
        let store = Arc::new(CubeCacheStore::new(config.cache));
        let manager = HypercubeManager::new(Arc::clone(&store), Arc::clone(&source));
        let invalidator = Arc::new(CacheInvalidator::new(
            Arc::clone(&store),
            source,
            config.invalidator,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            classifier: QueryClassifier::new(config.hypercube),
            store,
            manager,
            invalidator,
            persistence: PersistenceLifecycle::new(config.persistence),
            shutdown_tx,
            invalidator_task: Mutex::new(None),
        }
    }

    /// Restore the snapshot and start the invalidator
    pub fn start(&self) {
        let checkpoint = self.persistence.restore(&self.store);
        self.invalidator.seed_checkpoint(checkpoint);

        let handle = self.invalidator.spawn(self.shutdown_tx.subscribe());
        let running = handle.is_some();
        *self.invalidator_task.lock() = handle;

        info!(
            cached = self.store.len(),
            invalidator = running,
            "Cube service started"
        );
    }

    /// Stop the invalidator and write the snapshot. Never fails.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let task = self.invalidator_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Invalidator task ended abnormally");
            }
        }

        if let Err(e) = self
            .persistence
            .persist(&self.store, self.invalidator.checkpoint())
        {
            warn!(error = %e, "Cache snapshot not written");
        }
        info!("Cube service stopped");
    }

    /// Classify SQL without resolving it
    pub fn classify_sql(&self, sql: &str) -> Result<AggregationRequest> {
        self.classifier.classify_sql(sql).map_err(|e| {
            debug!(error = %e, "Rejected SQL");
            e
        })
    }

    /// Classify and resolve an aggregation statement
    pub async fn query_sql(&self, sql: &str) -> Result<Resolution> {
        let request = self.classify_sql(sql)?;
        self.manager.resolve_detailed(&request).await
    }

    /// Classify and resolve a structured cube request
    pub async fn query_cube(&self, params: &CubeParams) -> Result<Resolution> {
        let request = self.classifier.classify_cube(params).map_err(|e| {
            debug!(error = %e, "Rejected cube request");
            e
        })?;
        self.manager.resolve_detailed(&request).await
    }

    /// Resolve an already classified request
    pub async fn resolve(&self, request: &AggregationRequest) -> Result<RecordBatch> {
        self.manager.resolve(request).await
    }

    /// Current cache metrics
    pub fn metrics(&self) -> CubeMetrics {
        let stats = self.store.stats();
        let persistence = self.persistence.config();
        CubeMetrics {
            tables_cached: self.store.len(),
            total_rows: self.store.total_rows(),
            cache_keys: self.store.keys().iter().map(|k| k.to_string()).collect(),
            cache_hits: stats.hits(),
            cache_misses: stats.misses(),
            rollup_hits: stats.rollup_hits(),
            evictions: stats.evictions(),
            last_persist_ts: self.persistence.last_persist_ts(),
            persistent_enabled: persistence.enabled,
            persistent_path: persistence.path.clone(),
        }
    }

    /// Liveness and current entry count
    pub fn ping(&self) -> Ping {
        Ping {
            status: "ok".to_string(),
            cache_size: self.store.len(),
        }
    }

    /// Drop every cached entry; returns how many were removed
    pub fn invalidate_all(&self) -> usize {
        self.store.invalidate_all()
    }

    /// Drop the entries built from `table`; returns how many were removed
    pub fn invalidate_table(&self, table: &str) -> usize {
        self.store.invalidate(table)
    }

    /// The shared cache store
    pub fn store(&self) -> &Arc<CubeCacheStore> {
        &self.store
    }

    /// The background invalidator
    pub fn invalidator(&self) -> &Arc<CacheInvalidator> {
        &self.invalidator
    }

    /// The query classifier
    pub fn classifier(&self) -> &QueryClassifier {
        &self.classifier
    }
}

impl std::fmt::Debug for CubeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeService")
            .field("store", &self.store)
            .field("invalidator", &self.invalidator)
            .finish()
    }
}
