//! Cube Cache Store

use crate::config::CacheConfig;
use crate::key::CanonicalKey;
use crate::stats::CacheStats;
use crate::subsumption::covers;
use arrow::record_batch::RecordBatch;
use cube_core::{unix_millis, CubeError, Result};
use cube_parser::{AggregationRequest, Predicate};
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A materialized aggregate. Immutable once stored apart from its access time.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CanonicalKey,
    pub request: AggregationRequest,
    /// Dimensions in requested order, then the measure column
    pub table: RecordBatch,
    pub row_count: usize,
    /// Unix millis
    pub created_at: u64,
    last_access_at: AtomicU64,
    /// Store-local access sequence, higher is more recent
    recency: AtomicU64,
}

impl CacheEntry {
    pub fn new(request: AggregationRequest, table: RecordBatch) -> Self {
        let now = unix_millis();
        Self::with_timestamps(request, table, now, now)
    }

    pub fn with_timestamps(
        request: AggregationRequest,
        table: RecordBatch,
        created_at: u64,
        last_access_at: u64,
    ) -> Self {
        Self {
            key: CanonicalKey::build(&request),
            row_count: table.num_rows(),
            request,
            table,
            created_at,
            last_access_at: AtomicU64::new(last_access_at),
            recency: AtomicU64::new(0),
        }
    }

    pub fn last_access_at(&self) -> u64 {
        self.last_access_at.load(Ordering::Relaxed)
    }

    fn recency(&self) -> u64 {
        self.recency.load(Ordering::Relaxed)
    }

    fn touch(&self, tick: u64) {
        self.last_access_at.store(unix_millis(), Ordering::Relaxed);
        self.recency.fetch_max(tick, Ordering::Relaxed);
    }

    pub fn source_table(&self) -> &str {
        &self.request.source_table
    }

    pub fn dimension_set(&self) -> BTreeSet<String> {
        self.request.dimension_set()
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(unix_millis().saturating_sub(self.created_at))
    }

    /// Check if this entry has expired based on TTL
    pub fn is_expired(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.created_at) > ttl.as_millis() as u64
    }
}

/// A cached entry that can answer a request after local processing
#[derive(Debug, Clone)]
pub struct Subsumption {
    pub entry: Arc<CacheEntry>,
    /// Filter to apply to the cached rows first
    pub residual: Option<Predicate>,
}

/// Bounded, thread-safe mapping from canonical key to materialized aggregate.
///
/// Lookups share a read lock and record access on the entry itself, so
/// readers of distinct keys never wait on each other. Eviction removes the
/// least recently accessed entry; entries also expire `ttl` after creation
/// and are dropped lazily when a lookup runs into them.
///
/// Every invalidation advances an epoch. Results computed before an
/// invalidation are stored through [`CubeCacheStore::put_if_current`] so they
/// never land in the store after it.
pub struct CubeCacheStore {
    entries: RwLock<LruCache<CanonicalKey, Arc<CacheEntry>>>,
    /// Only advanced while `entries` is write-locked
    epoch: AtomicU64,
    /// Source of entry recency ticks
    clock: AtomicU64,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl CubeCacheStore {
    /// Create an empty store
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            epoch: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            config,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Create a store with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Whether entries are kept at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Invalidation epoch; read it before computing a result to store
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn capacity(&self) -> usize {
        self.config.max_tables.max(1)
    }

    /// Exact lookup; refreshes the entry's access time on a hit
    pub fn get(&self, key: &CanonicalKey) -> Option<Arc<CacheEntry>> {
        if !self.config.enabled {
            return None;
        }

        let entry = Arc::clone(self.entries.read().peek(key)?);

        if entry.is_expired(self.config.ttl, unix_millis()) {
            self.remove_expired(&[Arc::clone(&entry)]);
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        entry.touch(self.tick());
        Some(entry)
    }

    /// Look at an entry without touching its recency or access time
    pub fn peek(&self, key: &CanonicalKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().peek(key).cloned()
    }

    /// Find the cheapest live entry that covers `request`.
    ///
    /// Cheapest means fewest extra dimensions, then fewest rows. Expired
    /// entries met during the scan are evicted.
    pub fn find_subsuming(&self, request: &AggregationRequest) -> Option<Subsumption> {
        if !self.config.enabled {
            return None;
        }

        let now = unix_millis();
        let mut expired = Vec::new();
        let mut best: Option<((usize, usize), Subsumption)> = None;

        for (_, entry) in self.entries.read().iter() {
            if entry.request.source_table != request.source_table {
                continue;
            }
            if entry.is_expired(self.config.ttl, now) {
                expired.push(Arc::clone(entry));
                continue;
            }
            let Some(cover) = covers(&entry.request, request) else {
                continue;
            };

            let rank = (cover.extra_dimensions, entry.row_count);
            if best.as_ref().map_or(true, |(best_rank, _)| rank < *best_rank) {
                best = Some((
                    rank,
                    Subsumption {
                        entry: Arc::clone(entry),
                        residual: cover.residual,
                    },
                ));
            }
        }

        if !expired.is_empty() {
            self.remove_expired(&expired);
        }

        let (_, found) = best?;
        found.entry.touch(self.tick());
        Some(found)
    }

    /// Drop entries found expired under the read lock, unless replaced since
    fn remove_expired(&self, expired: &[Arc<CacheEntry>]) {
        let mut entries = self.entries.write();
        for entry in expired {
            if entries
                .peek(&entry.key)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                entries.pop(&entry.key);
                self.stats.record_expiration();
            }
        }
    }

    /// Store a result under the request's canonical key.
    ///
    /// Results above `max_rows_per_table` are refused with
    /// `CacheCapacityExceeded`. When the cache is disabled the entry is built
    /// but not kept.
    pub fn put(&self, request: AggregationRequest, table: RecordBatch) -> Result<Arc<CacheEntry>> {
        self.put_entry(request, table, None)
    }

    /// Like [`put`](Self::put), but refuses with `InvalidatedDuringBuild` when
    /// the store was invalidated after `epoch` was read.
    pub fn put_if_current(
        &self,
        request: AggregationRequest,
        table: RecordBatch,
        epoch: u64,
    ) -> Result<Arc<CacheEntry>> {
        self.put_entry(request, table, Some(epoch))
    }

    fn put_entry(
        &self,
        request: AggregationRequest,
        table: RecordBatch,
        epoch: Option<u64>,
    ) -> Result<Arc<CacheEntry>> {
        let rows = table.num_rows();
        if rows > self.config.max_rows_per_table {
            self.stats.record_refused_put();
            warn!(
                rows,
                limit = self.config.max_rows_per_table,
                "Result too large to cache"
            );
            return Err(CubeError::CacheCapacityExceeded {
                rows,
                limit: self.config.max_rows_per_table,
            });
        }

        let entry = Arc::new(CacheEntry::new(request, table));
        if self.config.enabled {
            if !self.insert(Arc::clone(&entry), epoch) {
                debug!(key = %entry.key, "Dropping result built before an invalidation");
                return Err(CubeError::InvalidatedDuringBuild);
            }
            debug!(id = %entry.key.short_id(), key = %entry.key, rows, "Cached aggregate");
        }
        Ok(entry)
    }

    /// Returns false, storing nothing, when `epoch` is stale
    fn insert(&self, entry: Arc<CacheEntry>, epoch: Option<u64>) -> bool {
        let mut entries = self.entries.write();

        if epoch.is_some_and(|e| e != self.epoch.load(Ordering::Acquire)) {
            return false;
        }

        if !entries.contains(&entry.key) && entries.len() >= self.capacity() {
            self.purge_expired(&mut entries);
            while entries.len() >= self.capacity() {
                let Some(victim) = least_recent(&entries) else {
                    break;
                };
                entries.pop(&victim);
                self.stats.record_eviction();
                debug!(id = %victim.short_id(), "Evicted least recently used entry");
            }
        }

        entry.recency.fetch_max(self.tick(), Ordering::Relaxed);
        // Replacing an existing key swaps the Arc; readers keep the old table
        entries.push(entry.key.clone(), entry);
        true
    }

    fn purge_expired(&self, entries: &mut LruCache<CanonicalKey, Arc<CacheEntry>>) {
        let now = unix_millis();
        let expired: Vec<CanonicalKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.config.ttl, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            entries.pop(&key);
            self.stats.record_expiration();
        }
    }

    /// Drop every entry; returns how many were removed
    pub fn invalidate_all(&self) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let removed = entries.len();
            entries.clear();
            removed
        };

        self.stats.record_invalidated(removed as u64);
        info!(removed, "Invalidated all cache entries");
        removed
    }

    /// Drop the entries built from `source_table`
    pub fn invalidate(&self, source_table: &str) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let keys: Vec<CanonicalKey> = entries
                .iter()
                .filter(|(_, entry)| entry.source_table().eq_ignore_ascii_case(source_table))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.pop(key);
            }
            keys.len()
        };

        self.stats.record_invalidated(removed as u64);
        info!(table = source_table, removed, "Invalidated cache entries for table");
        removed
    }

    /// All entries, least recently used first
    pub fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        let mut out: Vec<Arc<CacheEntry>> = self
            .entries
            .read()
            .iter()
            .map(|(_, e)| Arc::clone(e))
            .collect();
        out.sort_by_key(|e| e.recency());
        out
    }

    /// Load entries from a snapshot.
    ///
    /// Entries go in oldest access first so the most recently used survive
    /// when there are more than `max_tables`. Expired and oversized entries
    /// are skipped. Returns the number of entries restored.
    pub fn restore(&self, mut restored: Vec<CacheEntry>) -> usize {
        if !self.config.enabled {
            return 0;
        }

        restored.sort_by_key(|e| e.last_access_at());

        let now = unix_millis();
        let mut loaded = Vec::new();
        for entry in restored {
            if entry.row_count > self.config.max_rows_per_table {
                warn!(key = %entry.key, rows = entry.row_count, "Skipping oversized snapshot entry");
                continue;
            }
            if entry.is_expired(self.config.ttl, now) {
                debug!(key = %entry.key, "Skipping expired snapshot entry");
                continue;
            }
            loaded.push(entry.key.clone());
            self.insert(Arc::new(entry), None);
        }

        let entries = self.entries.read();
        loaded.iter().filter(|key| entries.contains(*key)).count()
    }

    /// Keys of all stored entries
    pub fn keys(&self) -> Vec<CanonicalKey> {
        self.entries.read().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Rows across all stored entries
    pub fn total_rows(&self) -> usize {
        self.entries.read().iter().map(|(_, e)| e.row_count).sum()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Shared hit/miss counters
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Get store configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl std::fmt::Debug for CubeCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeCacheStore")
            .field("enabled", &self.config.enabled)
            .field("max_tables", &self.config.max_tables)
            .field("max_rows_per_table", &self.config.max_rows_per_table)
            .field("ttl", &self.config.ttl)
            .field("current_entries", &self.len())
            .finish()
    }
}

/// Key of the entry with the oldest access, if any
fn least_recent(entries: &LruCache<CanonicalKey, Arc<CacheEntry>>) -> Option<CanonicalKey> {
    entries
        .iter()
        .min_by_key(|(_, entry)| entry.recency())
        .map(|(key, _)| key.clone())
}
