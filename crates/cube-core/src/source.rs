//! Source system collaborator
//!
//! The relational system of record sits behind this trait. Connection pooling,
//! transactions and statement timeouts are the implementor's concern; the cache
//! only needs read-only execution and a scalar freshness probe.

use crate::error::Result;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Execute a read-only aggregation statement and return its rows.
    async fn execute(&self, sql: &str) -> Result<RecordBatch>;

    /// Run a freshness probe returning a single scalar.
    ///
    /// `None` means the probe produced SQL NULL.
    async fn probe(&self, sql: &str) -> Result<Option<String>>;
}
