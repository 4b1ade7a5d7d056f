//! Cache configuration options

use cube_core::time::duration_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the cube cache store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Time-to-live for cache entries, measured from creation
    #[serde(rename = "cache_ttl_seconds", with = "duration_secs")]
    pub ttl: Duration,
    /// Maximum number of cached tables
    pub max_tables: usize,
    /// Results with more rows than this are returned but not cached
    pub max_rows_per_table: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(900), // 15 minutes
            max_tables: 100,
            max_rows_per_table: 1_000_000,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration with custom settings
    pub fn new(max_tables: usize, max_rows_per_table: usize, ttl_secs: u64) -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(ttl_secs),
            max_tables,
            max_rows_per_table,
        }
    }

    /// Create a disabled cache configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables = max_tables;
        self
    }

    pub fn with_max_rows_per_table(mut self, max_rows: usize) -> Self {
        self.max_rows_per_table = max_rows;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
