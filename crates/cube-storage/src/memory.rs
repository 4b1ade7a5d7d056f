//! In-memory source system
//!
//! Serves as the system of record for the CLI and for tests: fact tables are
//! held as Arrow batches and the aggregation statements produced by the
//! Hypercube Manager are answered with the local engine.

use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use cube_core::{CubeError, Result, SourceSystem};
use cube_executor::ArrowEngine;
use cube_parser::{canonical_table_name, ClassifierConfig, QueryClassifier};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct MemorySource {
    /// Keyed by canonical table name
    tables: RwLock<HashMap<String, RecordBatch>>,
    classifier: QueryClassifier,
    engine: ArrowEngine,
    statements: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            classifier: QueryClassifier::new(ClassifierConfig::permissive()),
            engine: ArrowEngine::new(),
            statements: AtomicU64::new(0),
        }
    }

    /// Register or replace a table
    pub fn register_table(&self, name: &str, batch: RecordBatch) -> Result<()> {
        let name = canonical_table_name(name)?;
        info!(table = %name, rows = batch.num_rows(), "Registered table");
        self.tables.write().insert(name, batch);
        Ok(())
    }

    pub fn deregister_table(&self, name: &str) -> Option<RecordBatch> {
        let name = canonical_table_name(name).ok()?;
        self.tables.write().remove(&name)
    }

    /// Registered tables with their row counts, sorted by name
    pub fn tables(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .tables
            .read()
            .iter()
            .map(|(name, batch)| (name.clone(), batch.num_rows()))
            .collect();
        out.sort();
        out
    }

    /// Statements executed so far, probes included
    pub fn execute_count(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    /// Exact name first, then the name without its schema qualifier
    fn lookup(&self, name: &str) -> Result<RecordBatch> {
        let tables = self.tables.read();
        tables
            .get(name)
            .or_else(|| {
                let (_, unqualified) = name.rsplit_once('.')?;
                tables.get(unqualified)
            })
            .cloned()
            .ok_or_else(|| CubeError::ExecutionError(format!("Table '{}' does not exist", name)))
    }

    fn run(&self, sql: &str) -> Result<RecordBatch> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        debug!(sql, "Executing statement");

        let request = self.classifier.classify_sql(sql)?;
        let facts = self.lookup(&request.source_table)?;
        self.engine.aggregate(&facts, &request)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("tables", &self.tables())
            .field("statements", &self.execute_count())
            .finish()
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    async fn execute(&self, sql: &str) -> Result<RecordBatch> {
        self.run(sql)
    }

    /// The probe must be a single aggregate without dimensions, e.g.
    /// `SELECT MAX(updated_at) FROM updates`
    async fn probe(&self, sql: &str) -> Result<Option<String>> {
        let result = self.run(sql)?;
        if result.num_columns() != 1 || result.num_rows() != 1 {
            return Err(CubeError::ExecutionError(
                "Freshness probe must return a single value".to_string(),
            ));
        }

        let value = result.column(0);
        if value.is_null(0) {
            return Ok(None);
        }
        Ok(Some(array_value_to_string(value, 0)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn facts() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("p1", DataType::Utf8, false),
            Field::new("count", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "a"])),
                Arc::new(Int64Array::from(vec![Some(1), Some(2), None])),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_against_unqualified_table() {
        let source = MemorySource::new();
        source.register_table("facts_agg", facts()).unwrap();

        let out = source
            .execute(r#"SELECT p1, SUM(count) AS "SUM(count)" FROM public.facts_agg GROUP BY p1"#)
            .await
            .unwrap();
        assert_eq!(out.num_rows(), 2);
        assert_eq!(source.execute_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let source = MemorySource::new();
        let err = source
            .execute("SELECT p1, SUM(count) FROM nope GROUP BY p1")
            .await
            .unwrap_err();
        assert!(matches!(err, CubeError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn test_probe_returns_scalar_text() {
        let source = MemorySource::new();
        source.register_table("Updates", facts()).unwrap();

        assert_eq!(
            source.probe("SELECT MAX(count) FROM updates").await.unwrap(),
            Some("2".to_string())
        );
        assert_eq!(
            source.probe("SELECT COUNT(*) FROM updates").await.unwrap(),
            Some("3".to_string())
        );
        // empty selection: MAX over nothing is NULL
        assert_eq!(
            source
                .probe("SELECT MAX(count) FROM updates WHERE p1 = 'zzz'")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_probe_with_dimensions_is_rejected() {
        let source = MemorySource::new();
        source.register_table("updates", facts()).unwrap();
        assert!(source
            .probe("SELECT p1, MAX(count) FROM updates GROUP BY p1")
            .await
            .is_err());
    }

    #[test]
    fn test_table_listing() {
        let source = MemorySource::new();
        source.register_table("b", facts()).unwrap();
        source.register_table("a", facts()).unwrap();
        assert_eq!(source.tables(), vec![("a".to_string(), 3), ("b".to_string(), 3)]);
        assert!(source.deregister_table("A").is_some());
        assert_eq!(source.tables().len(), 1);
    }
}
