//! Hypercube Manager
//!
//! Resolves aggregation requests against the cube cache: exact hits are served
//! as stored, covered requests are rolled up locally, and everything else is
//! delegated to the source system and cached.
//!
//! Population is single-flight per canonical key. The first caller to miss
//! becomes the builder; concurrent callers for the same key wait on its
//! outcome, success or failure, instead of reaching the source themselves.

use crate::engine::ArrowEngine;
use arrow::record_batch::RecordBatch;
use cube_cache::{CanonicalKey, CubeCacheStore};
use cube_core::{CubeError, Result, SourceSystem};
use cube_parser::AggregationRequest;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrigin {
    /// Stored entry for the same key
    ExactHit,
    /// Derived locally from a finer cached entry
    RollUp,
    /// Delegated to the source system
    Source,
    /// Waited on a concurrent build of the same key
    Coalesced,
}

impl ResolutionOrigin {
    /// Whether the source was left untouched
    pub fn is_cache_served(&self) -> bool {
        !matches!(self, ResolutionOrigin::Source)
    }
}

impl std::fmt::Display for ResolutionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionOrigin::ExactHit => "cache hit",
            ResolutionOrigin::RollUp => "roll-up",
            ResolutionOrigin::Source => "source",
            ResolutionOrigin::Coalesced => "coalesced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// Requested dimensions in requested order, then the measure
    pub table: RecordBatch,
    pub origin: ResolutionOrigin,
    /// Set when the result could not be cached, e.g. `CacheCapacityExceeded`
    /// or `InvalidatedDuringBuild`
    pub not_cached: Option<CubeError>,
}

impl Resolution {
    fn new(table: RecordBatch, origin: ResolutionOrigin) -> Self {
        Self {
            table,
            origin,
            not_cached: None,
        }
    }
}

type Flight = Arc<OnceCell<Result<Resolution>>>;

pub struct HypercubeManager {
    store: Arc<CubeCacheStore>,
    source: Arc<dyn SourceSystem>,
    engine: ArrowEngine,
    /// Builds in progress, one per key
    inflight: DashMap<CanonicalKey, Flight>,
}

impl HypercubeManager {
    /// Create a manager over a shared store and source
    pub fn new(store: Arc<CubeCacheStore>, source: Arc<dyn SourceSystem>) -> Self {
        Self {
            store,
            source,
            engine: ArrowEngine::new(),
            inflight: DashMap::new(),
        }
    }

    /// The store this manager populates
    pub fn store(&self) -> &Arc<CubeCacheStore> {
        &self.store
    }

    /// Number of keys with a build in progress
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Resolve a request to its result table
    pub async fn resolve(&self, request: &AggregationRequest) -> Result<RecordBatch> {
        self.resolve_detailed(request).await.map(|r| r.table)
    }

    /// Resolve a request, reporting where the result came from.
    ///
    /// Source failures reach every caller waiting on the same key and are
    /// never cached.
    pub async fn resolve_detailed(&self, request: &AggregationRequest) -> Result<Resolution> {
        let stats = self.store.stats();

        if !self.store.is_enabled() {
            stats.record_miss();
            let table = self.delegate(request).await?;
            return Ok(Resolution::new(table, ResolutionOrigin::Source));
        }

        let key = CanonicalKey::build(request);
        if let Some(resolution) = self.exact_hit(&key, request) {
            return Ok(resolution);
        }

        let flight = Arc::clone(&self.inflight.entry(key.clone()).or_default());
        let built = AtomicBool::new(false);
        let (built_ref, key_ref) = (&built, &key);

        let outcome = flight
            .get_or_init(|| async move {
                built_ref.store(true, Ordering::Relaxed);
                self.build(key_ref, request).await
            })
            .await
            .clone();

        self.inflight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &flight));

        if built.load(Ordering::Relaxed) {
            return outcome;
        }

        // The builder may have asked for another column order
        let resolution = outcome?;
        stats.record_coalesced();
        debug!(key = %key, "Served by concurrent build");
        Ok(Resolution {
            table: self.engine.project(&resolution.table, request)?,
            origin: ResolutionOrigin::Coalesced,
            not_cached: resolution.not_cached,
        })
    }

    fn exact_hit(&self, key: &CanonicalKey, request: &AggregationRequest) -> Option<Resolution> {
        let entry = self.store.get(key)?;
        match self.engine.project(&entry.table, request) {
            Ok(table) => {
                self.store.stats().record_hit();
                debug!(key = %key, rows = entry.row_count, "Cache hit");
                Some(Resolution::new(table, ResolutionOrigin::ExactHit))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Unusable cache entry");
                None
            }
        }
    }

    /// Runs once per key at a time
    async fn build(&self, key: &CanonicalKey, request: &AggregationRequest) -> Result<Resolution> {
        // Results are only stored if no invalidation happens from here on
        let epoch = self.store.epoch();

        // Another build for this key may have completed since the first lookup
        if let Some(resolution) = self.exact_hit(key, request) {
            return Ok(resolution);
        }

        if let Some(resolution) = self.roll_up(key, request, epoch) {
            return Ok(resolution);
        }

        self.store.stats().record_miss();
        debug!(key = %key, "Cache miss");
        let table = self.delegate(request).await?;
        Ok(self.populate(request, table, ResolutionOrigin::Source, epoch))
    }

    fn roll_up(
        &self,
        key: &CanonicalKey,
        request: &AggregationRequest,
        epoch: u64,
    ) -> Option<Resolution> {
        let found = self.store.find_subsuming(request)?;
        let base = &found.entry;

        match self
            .engine
            .rollup(&base.table, &base.request, request, found.residual.as_ref())
        {
            Ok(table) => {
                self.store.stats().record_rollup_hit();
                debug!(key = %key, from = %base.key, rows = table.num_rows(), "Rolled up from cached cube");
                Some(self.populate(request, table, ResolutionOrigin::RollUp, epoch))
            }
            Err(e) => {
                warn!(key = %key, from = %base.key, error = %e, "Roll-up failed, delegating to source");
                None
            }
        }
    }

    /// Cache `table` and wrap it; a refused put is reported, not raised
    fn populate(
        &self,
        request: &AggregationRequest,
        table: RecordBatch,
        origin: ResolutionOrigin,
        epoch: u64,
    ) -> Resolution {
        match self.store.put_if_current(request.clone(), table.clone(), epoch) {
            Ok(_) => Resolution::new(table, origin),
            Err(e) => Resolution {
                table,
                origin,
                not_cached: Some(e),
            },
        }
    }

    async fn delegate(&self, request: &AggregationRequest) -> Result<RecordBatch> {
        let sql = request.to_sql();
        debug!(sql = %sql, "Delegating to source");

        let table = self.source.execute(&sql).await.map_err(|e| {
            warn!(error = %e, "Source delegation failed");
            match e {
                CubeError::SourceDelegationFailure(_) => e,
                other => CubeError::SourceDelegationFailure(other.to_string()),
            }
        })?;

        let table = self.engine.conform(table, request)?;
        info!(table = %request.source_table, rows = table.num_rows(), "Loaded aggregate from source");
        Ok(table)
    }
}

impl std::fmt::Debug for HypercubeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypercubeManager")
            .field("store", &self.store)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingSource;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::util::display::array_value_to_string;
    use cube_cache::CacheConfig;
    use cube_parser::{ClassifierConfig, CubeParams, QueryClassifier};
    use futures::future::join_all;
    use std::time::Duration;

    fn setup(config: CacheConfig, source: CountingSource) -> (HypercubeManager, Arc<CountingSource>) {
        let source = Arc::new(source);
        let store = Arc::new(CubeCacheStore::new(config));
        (HypercubeManager::new(store, source.clone()), source)
    }

    fn cube(dims: &str) -> AggregationRequest {
        QueryClassifier::new(ClassifierConfig::default())
            .classify_cube(&CubeParams::from_dims_str(dims))
            .unwrap()
    }

    fn sql(text: &str) -> AggregationRequest {
        QueryClassifier::new(ClassifierConfig::permissive())
            .classify_sql(text)
            .unwrap()
    }

    fn rows(batch: &RecordBatch) -> Vec<String> {
        let mut out: Vec<String> = (0..batch.num_rows())
            .map(|r| {
                batch
                    .columns()
                    .iter()
                    .map(|c| array_value_to_string(c, r).unwrap())
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_miss_hit_then_rollup() {
        let (manager, source) = setup(CacheConfig::default(), CountingSource::new());
        let stats = manager.store().stats();

        let first = manager.resolve_detailed(&cube("p1,p2")).await.unwrap();
        assert_eq!(first.origin, ResolutionOrigin::Source);
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.store().len(), 1);

        let second = manager.resolve_detailed(&cube("p1,p2")).await.unwrap();
        assert_eq!(second.origin, ResolutionOrigin::ExactHit);
        assert_eq!(source.calls(), 1);
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);

        let coarse = manager.resolve_detailed(&cube("p1")).await.unwrap();
        assert_eq!(coarse.origin, ResolutionOrigin::RollUp);
        assert_eq!(source.calls(), 1);
        assert_eq!(stats.rollup_hits(), 1);
        assert_eq!(rows(&coarse.table), vec!["a|8", "b|7", "c|6"]);

        // the roll-up is now an entry of its own
        assert_eq!(manager.store().len(), 2);
        let again = manager.resolve_detailed(&cube("p1")).await.unwrap();
        assert_eq!(again.origin, ResolutionOrigin::ExactHit);
    }

    #[tokio::test]
    async fn test_rollup_equals_source_answer() {
        let (manager, _) = setup(CacheConfig::default(), CountingSource::new());
        let (direct, _) = setup(CacheConfig::default(), CountingSource::new());

        manager
            .resolve(&sql("SELECT p1, p2, p3, SUM(count) FROM public.facts_agg GROUP BY p1, p2, p3"))
            .await
            .unwrap();

        let wanted = sql("SELECT p2, SUM(count) FROM public.facts_agg WHERE p3 > 1 GROUP BY p2");
        let rolled = manager.resolve_detailed(&wanted).await.unwrap();
        assert_eq!(rolled.origin, ResolutionOrigin::RollUp);

        let fresh = direct.resolve_detailed(&wanted).await.unwrap();
        assert_eq!(fresh.origin, ResolutionOrigin::Source);
        assert_eq!(rows(&rolled.table), rows(&fresh.table));
    }

    #[tokio::test]
    async fn test_exact_hit_uses_requested_order() {
        let (manager, source) = setup(CacheConfig::default(), CountingSource::new());

        manager.resolve(&cube("p1,p2")).await.unwrap();
        let swapped = manager.resolve_detailed(&cube("p2,p1")).await.unwrap();

        assert_eq!(swapped.origin, ResolutionOrigin::ExactHit);
        assert_eq!(source.calls(), 1);
        let schema = swapped.table.schema();
        assert_eq!(schema.field(0).name(), "p2");
        assert_eq!(schema.field(1).name(), "p1");
    }

    #[tokio::test]
    async fn test_concurrent_misses_build_once() {
        let (manager, source) = setup(
            CacheConfig::default(),
            CountingSource::new().with_delay(Duration::from_millis(50)),
        );
        let request = cube("p1,p2");

        let results = join_all((0..16).map(|_| manager.resolve_detailed(&request))).await;

        assert_eq!(source.calls(), 1);
        let coalesced = results
            .iter()
            .filter(|r| r.as_ref().unwrap().origin == ResolutionOrigin::Coalesced)
            .count();
        assert_eq!(coalesced, 15);
        assert_eq!(manager.store().stats().misses(), 1);
        assert_eq!(manager.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_build_once() {
        let (manager, source) = setup(
            CacheConfig::default(),
            CountingSource::new().with_delay(Duration::from_millis(100)),
        );
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                // same key, different presentation order
                let dims = if i % 2 == 0 { "p1,p2" } else { "p2,p1" };
                tokio::spawn(async move { manager.resolve(&cube(dims)).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().num_rows(), 5);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let (manager, source) = setup(
            CacheConfig::default(),
            CountingSource::new().with_delay(Duration::from_millis(20)),
        );
        source.set_failing(true);
        let request = cube("p1");

        let results = join_all((0..4).map(|_| manager.resolve(&request))).await;
        for result in &results {
            assert!(matches!(result, Err(CubeError::SourceDelegationFailure(_))));
        }
        assert_eq!(source.calls(), 1);
        assert!(manager.store().is_empty());

        source.set_failing(false);
        assert!(manager.resolve(&request).await.is_ok());
        assert_eq!(source.calls(), 2);
        assert_eq!(manager.store().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_result_is_returned_not_cached() {
        let config = CacheConfig::default().with_max_rows_per_table(2);
        let (manager, source) = setup(config, CountingSource::new());

        let resolution = manager.resolve_detailed(&cube("p1,p2")).await.unwrap();
        assert_eq!(resolution.table.num_rows(), 5);
        assert!(matches!(
            resolution.not_cached,
            Some(CubeError::CacheCapacityExceeded { rows: 5, limit: 2 })
        ));
        assert!(manager.store().is_empty());

        manager.resolve(&cube("p1,p2")).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_build_is_not_cached() {
        let (manager, source) = setup(
            CacheConfig::default(),
            CountingSource::new().with_delay(Duration::from_millis(200)),
        );
        let store = Arc::clone(manager.store());
        let request = sql("SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1");

        let (resolution, cleared) = tokio::join!(manager.resolve_detailed(&request), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.invalidate_all()
        });

        let resolution = resolution.unwrap();
        assert_eq!(cleared, 0);
        assert_eq!(resolution.origin, ResolutionOrigin::Source);
        assert_eq!(rows(&resolution.table), vec!["a|8", "b|7", "c|6"]);
        assert_eq!(resolution.not_cached, Some(CubeError::InvalidatedDuringBuild));
        assert_eq!(store.len(), 0);

        // the next request rebuilds from the source
        let again = manager.resolve_detailed(&request).await.unwrap();
        assert_eq!(again.origin, ResolutionOrigin::Source);
        assert_eq!(source.calls(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_count_rollup_matches_source_on_empty_selection() {
        let (manager, source) = setup(CacheConfig::default(), CountingSource::new());
        let (direct, _) = setup(CacheConfig::default(), CountingSource::new());

        manager
            .resolve(&sql("SELECT p1, COUNT(*) FROM public.facts_agg GROUP BY p1"))
            .await
            .unwrap();

        let wanted = sql("SELECT COUNT(*) FROM public.facts_agg WHERE p1 = 'zzz'");
        let rolled = manager.resolve_detailed(&wanted).await.unwrap();
        assert_eq!(rolled.origin, ResolutionOrigin::RollUp);
        assert_eq!(source.calls(), 1);

        let fresh = direct.resolve(&wanted).await.unwrap();
        assert_eq!(rows(&rolled.table), vec!["0"]);
        assert_eq!(rows(&rolled.table), rows(&fresh));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_delegates() {
        let (manager, source) = setup(CacheConfig::disabled(), CountingSource::new());

        for _ in 0..3 {
            let resolution = manager.resolve_detailed(&cube("p1")).await.unwrap();
            assert_eq!(resolution.origin, ResolutionOrigin::Source);
        }
        assert_eq!(source.calls(), 3);
        assert!(manager.store().is_empty());
        assert_eq!(manager.store().stats().misses(), 3);
    }

    #[tokio::test]
    async fn test_broken_rollup_falls_back_to_source() {
        let (manager, source) = setup(CacheConfig::default(), CountingSource::new());

        // an entry for (p1, p2) whose table lacks the dimension columns
        let schema = Arc::new(Schema::new(vec![Field::new("SUM(count)", DataType::Int64, true)]));
        let bogus = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();
        manager.store().put(cube("p1,p2"), bogus).unwrap();

        let resolution = manager.resolve_detailed(&cube("p1")).await.unwrap();
        assert_eq!(resolution.origin, ResolutionOrigin::Source);
        assert_eq!(source.calls(), 1);
        assert_eq!(rows(&resolution.table), vec!["a|8", "b|7", "c|6"]);
    }
}
