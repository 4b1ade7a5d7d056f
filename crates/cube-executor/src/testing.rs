//! Fake source system shared by the executor tests

use crate::engine::ArrowEngine;
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use cube_core::{CubeError, Result, SourceSystem};
use cube_parser::{ClassifierConfig, QueryClassifier};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn facts() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("p1", DataType::Utf8, false),
        Field::new("p2", DataType::Utf8, false),
        Field::new("p3", DataType::Int64, false),
        Field::new("count", DataType::Int64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(vec!["a", "a", "b", "b", "a", "c"])),
            Arc::new(StringArray::from(vec!["x", "y", "x", "y", "x", "z"])),
            Arc::new(Int64Array::from(vec![1, 2, 3, 1, 2, 3])),
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5, 6])),
        ],
    )
    .unwrap()
}

/// Answers every statement from [`facts`] and counts the calls
pub(crate) struct CountingSource {
    facts: RecordBatch,
    calls: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
    probe_value: Mutex<Option<String>>,
}

impl CountingSource {
    pub fn new() -> Self {
        Self {
            facts: facts(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            probe_value: Mutex::new(Some("v1".to_string())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_probe_value(&self, value: &str) {
        *self.probe_value.lock() = Some(value.to_string());
    }
}

#[async_trait]
impl SourceSystem for CountingSource {
    async fn execute(&self, sql: &str) -> Result<RecordBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CubeError::ExecutionError("connection reset".to_string()));
        }

        let request = QueryClassifier::new(ClassifierConfig::permissive()).classify_sql(sql)?;
        ArrowEngine::new().aggregate(&self.facts, &request)
    }

    async fn probe(&self, _sql: &str) -> Result<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CubeError::ExecutionError("connection reset".to_string()));
        }
        Ok(self.probe_value.lock().clone())
    }
}
