//! Hypercube result cache
//!
//! Stores aggregated result tables keyed by the canonical form of the request
//! that produced them. Besides exact lookups the store can find a cached
//! table at a finer grain that answers a request by roll-up.
//!
//! # Features
//!
//! - **LRU Eviction**: one table is evicted when the table count limit is hit
//! - **TTL Support**: expired entries are dropped lazily on access
//! - **Row Limit**: oversized results are served but never stored
//! - **Invalidation**: a background probe clears the store when source data changes
//! - **Persistence**: the store survives restarts through a snapshot file
//!
//! # Example
//!
//! ```ignore
//! use cube_cache::{CacheConfig, CanonicalKey, CubeCacheStore};
//!
//! let store = CubeCacheStore::new(CacheConfig::default());
//! let key = CanonicalKey::build(&request);
//! if let Some(entry) = store.get(&key) {
//!     return Ok(entry.table.clone());
//! }
//! store.put(request, table)?;
//! ```

pub mod cache;
pub mod config;
pub mod invalidation;
pub mod key;
pub mod lifecycle;
pub mod snapshot;
pub mod stats;
pub mod subsumption;

pub use cache::{CacheEntry, CubeCacheStore, Subsumption};
pub use config::CacheConfig;
pub use invalidation::{
    CacheInvalidator, InvalidationCheckpoint, InvalidatorConfig, InvalidatorState, ProbeOutcome,
};
pub use key::CanonicalKey;
pub use lifecycle::{PersistenceConfig, PersistenceLifecycle};
pub use snapshot::{read_snapshot, write_snapshot, CacheSnapshot};
pub use stats::CacheStats;
pub use subsumption::{covers, Cover};
