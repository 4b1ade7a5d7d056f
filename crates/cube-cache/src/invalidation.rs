//! Cache Invalidator
//!
//! Periodically runs a freshness probe against the source and clears the
//! whole store when the probed value moves. A failed probe never touches the
//! store; the next interval simply tries again.

use crate::cache::CubeCacheStore;
use cube_core::time::duration_secs;
use cube_core::{unix_millis, CubeError, SourceSystem};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Probe value recorded when the probe returns SQL NULL
pub const NULL_PROBE_VALUE: &str = "NULL";

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the background invalidator (the `invalidator` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidatorConfig {
    pub enabled: bool,
    #[serde(rename = "check_interval_seconds", with = "duration_secs")]
    pub interval: Duration,
    /// Freshness probe returning a single scalar
    pub query: String,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            query: String::new(),
        }
    }
}

impl InvalidatorConfig {
    pub fn new(query: impl Into<String>, interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            query: query.into(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Last probe value seen by the invalidator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationCheckpoint {
    pub last_seen_value: String,
    /// Unix millis of the last successful probe
    pub checked_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidatorState {
    Idle,
    Probing,
    Invalidating,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Unchanged,
    Changed {
        previous: Option<String>,
        current: String,
        cleared: usize,
    },
    Failed(CubeError),
}

pub struct CacheInvalidator {
    store: Arc<CubeCacheStore>,
    source: Arc<dyn SourceSystem>,
    config: InvalidatorConfig,
    checkpoint: RwLock<Option<InvalidationCheckpoint>>,
    state: RwLock<InvalidatorState>,
    probes: AtomicU64,
    failures: AtomicU64,
}

impl CacheInvalidator {
    pub fn new(
        store: Arc<CubeCacheStore>,
        source: Arc<dyn SourceSystem>,
        config: InvalidatorConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
            checkpoint: RwLock::new(None),
            state: RwLock::new(InvalidatorState::Idle),
            probes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &InvalidatorConfig {
        &self.config
    }

    pub fn state(&self) -> InvalidatorState {
        *self.state.read()
    }

    pub fn checkpoint(&self) -> Option<InvalidationCheckpoint> {
        self.checkpoint.read().clone()
    }

    /// Start from a checkpoint restored alongside the cache
    pub fn seed_checkpoint(&self, checkpoint: Option<InvalidationCheckpoint>) {
        *self.checkpoint.write() = checkpoint;
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run the freshness probe once and act on the result
    pub async fn probe_once(&self) -> ProbeOutcome {
        *self.state.write() = InvalidatorState::Probing;
        self.probes.fetch_add(1, Ordering::Relaxed);

        let value = match self.source.probe(&self.config.query).await {
            Ok(value) => value.unwrap_or_else(|| NULL_PROBE_VALUE.to_string()),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                *self.state.write() = InvalidatorState::Idle;
                warn!(error = %e, "Freshness probe failed, keeping cache");
                return ProbeOutcome::Failed(CubeError::InvalidationProbeFailure(e.to_string()));
            }
        };

        let now = unix_millis();
        let previous = self.checkpoint().map(|c| c.last_seen_value);

        if previous.as_deref() == Some(value.as_str()) {
            if let Some(checkpoint) = self.checkpoint.write().as_mut() {
                checkpoint.checked_at = now;
            }
            *self.state.write() = InvalidatorState::Idle;
            debug!(value = %value, "Source unchanged");
            return ProbeOutcome::Unchanged;
        }

        *self.state.write() = InvalidatorState::Invalidating;
        let cleared = self.store.invalidate_all();
        *self.checkpoint.write() = Some(InvalidationCheckpoint {
            last_seen_value: value.clone(),
            checked_at: now,
        });
        *self.state.write() = InvalidatorState::Idle;

        info!(
            previous = previous.as_deref().unwrap_or("<none>"),
            current = %value,
            cleared,
            "Source changed, cache invalidated"
        );

        ProbeOutcome::Changed {
            previous,
            current: value,
            cleared,
        }
    }

    /// Spawn the probe loop. Returns `None` when the invalidator is disabled.
    pub fn spawn(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            return None;
        }
        if self.config.query.trim().is_empty() {
            warn!("Invalidator enabled without a probe query, not starting");
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run(shutdown).await }))
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.interval.max(MIN_INTERVAL);
        info!(interval_ms = period.as_millis() as u64, "Cache invalidator started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Cache invalidator received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Invalidator shutdown receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }

        *self.state.write() = InvalidatorState::Stopped;
        info!("Cache invalidator stopped");
    }
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("checkpoint", &self.checkpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use async_trait::async_trait;
    use cube_core::Result;
    use cube_parser::{ClassifierConfig, CubeParams, QueryClassifier};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Source whose probe replays a script of answers
    struct ScriptedProbe {
        answers: Mutex<VecDeque<Result<Option<String>>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<Option<String>>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
            }
        }
    }

    #[async_trait]
    impl SourceSystem for ScriptedProbe {
        async fn execute(&self, _sql: &str) -> Result<RecordBatch> {
            Err(CubeError::SourceDelegationFailure("not used".into()))
        }

        async fn probe(&self, _sql: &str) -> Result<Option<String>> {
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Some("steady".into())))
        }
    }

    fn filled_store() -> Arc<CubeCacheStore> {
        let store = Arc::new(CubeCacheStore::new(CacheConfig::default()));
        let classifier = QueryClassifier::new(ClassifierConfig::default());
        let schema = Arc::new(Schema::new(vec![Field::new("SUM(count)", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();
        for dims in ["p1", "p2"] {
            let req = classifier.classify_cube(&CubeParams::from_dims_str(dims)).unwrap();
            store.put(req, batch.clone()).unwrap();
        }
        store
    }

    fn invalidator(
        store: &Arc<CubeCacheStore>,
        answers: Vec<Result<Option<String>>>,
    ) -> Arc<CacheInvalidator> {
        Arc::new(CacheInvalidator::new(
            Arc::clone(store),
            Arc::new(ScriptedProbe::new(answers)),
            InvalidatorConfig::new("SELECT MAX(updated_at) FROM updates", Duration::from_millis(20)),
        ))
    }

    #[tokio::test]
    async fn test_first_probe_clears_without_checkpoint() {
        let store = filled_store();
        let inv = invalidator(&store, vec![Ok(Some("t1".into()))]);

        let outcome = inv.probe_once().await;
        assert_eq!(
            outcome,
            ProbeOutcome::Changed {
                previous: None,
                current: "t1".into(),
                cleared: 2,
            }
        );
        assert!(store.is_empty());
        assert_eq!(inv.checkpoint().unwrap().last_seen_value, "t1");
        assert_eq!(inv.state(), InvalidatorState::Idle);
    }

    #[tokio::test]
    async fn test_seeded_checkpoint_keeps_cache() {
        let store = filled_store();
        let inv = invalidator(&store, vec![Ok(Some("t1".into()))]);
        inv.seed_checkpoint(Some(InvalidationCheckpoint {
            last_seen_value: "t1".into(),
            checked_at: 0,
        }));

        assert_eq!(inv.probe_once().await, ProbeOutcome::Unchanged);
        assert_eq!(store.len(), 2);
        assert!(inv.checkpoint().unwrap().checked_at > 0);
    }

    #[tokio::test]
    async fn test_value_change_invalidates() {
        let store = filled_store();
        let inv = invalidator(&store, vec![Ok(Some("t1".into())), Ok(Some("t2".into()))]);
        inv.seed_checkpoint(Some(InvalidationCheckpoint {
            last_seen_value: "t1".into(),
            checked_at: 0,
        }));

        assert_eq!(inv.probe_once().await, ProbeOutcome::Unchanged);
        assert_eq!(store.len(), 2);

        let outcome = inv.probe_once().await;
        assert!(matches!(outcome, ProbeOutcome::Changed { cleared: 2, .. }));
        assert!(store.is_empty());
        assert_eq!(inv.checkpoint().unwrap().last_seen_value, "t2");
    }

    #[tokio::test]
    async fn test_probe_failure_never_invalidates() {
        let store = filled_store();
        let inv = invalidator(
            &store,
            vec![Err(CubeError::SourceDelegationFailure("connection reset".into()))],
        );

        let outcome = inv.probe_once().await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(CubeError::InvalidationProbeFailure(_))
        ));
        assert_eq!(store.len(), 2);
        assert!(inv.checkpoint().is_none());
        assert_eq!(inv.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_null_probe_value() {
        let store = filled_store();
        let inv = invalidator(&store, vec![Ok(None)]);

        inv.probe_once().await;
        assert_eq!(inv.checkpoint().unwrap().last_seen_value, NULL_PROBE_VALUE);
    }

    #[tokio::test]
    async fn test_background_loop_and_shutdown() {
        let store = filled_store();
        let inv = invalidator(&store, vec![]);
        let (tx, rx) = broadcast::channel(1);

        let handle = inv.spawn(rx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(inv.probe_count() >= 2);
        assert!(store.is_empty());
        assert_eq!(inv.checkpoint().unwrap().last_seen_value, "steady");

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(inv.state(), InvalidatorState::Stopped);
    }

    #[test]
    fn test_disabled_does_not_spawn() {
        let store = filled_store();
        let inv = Arc::new(CacheInvalidator::new(
            Arc::clone(&store),
            Arc::new(ScriptedProbe::new(vec![])),
            InvalidatorConfig::default(),
        ));
        let (_tx, rx) = broadcast::channel(1);
        assert!(inv.spawn(rx).is_none());
    }

    #[test]
    fn test_config_from_json() {
        let config: InvalidatorConfig = serde_json::from_str(
            r#"{"enabled": true, "check_interval_seconds": 5, "query": "SELECT 1"}"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_secs(5));
    }
}
