//! Embedded analytical engine
//!
//! Everything the manager computes locally runs here: aggregating raw facts,
//! rolling a cached cube up to a coarser grain and reshaping tables to the
//! requested column layout.

use crate::aggregate::{filter_batch, group_aggregate};
use arrow::array::{AsArray, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use cube_core::{CubeError, Result};
use cube_parser::{AggregateFunction, AggregationRequest, Predicate};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArrowEngine;

impl ArrowEngine {
    pub fn new() -> Self {
        Self
    }

    /// Answer `request` directly from a fact table
    pub fn aggregate(&self, facts: &RecordBatch, request: &AggregationRequest) -> Result<RecordBatch> {
        let filtered = filter_batch(facts, request.filters.as_ref())?;
        group_aggregate(
            &filtered,
            &request.dimensions,
            request.measure.func,
            request.measure.column.as_deref(),
            &request.measure_name(),
        )
    }

    /// Derive `request` from a cached table computed for `cached`.
    ///
    /// `residual` is applied to the cached rows first. At equal grain the
    /// filtered rows are only reordered; otherwise they are re-aggregated with
    /// the measure's roll-up function.
    pub fn rollup(
        &self,
        table: &RecordBatch,
        cached: &AggregationRequest,
        request: &AggregationRequest,
        residual: Option<&Predicate>,
    ) -> Result<RecordBatch> {
        let filtered = filter_batch(table, residual)?;

        if cached.dimension_set() == request.dimension_set() {
            return self.project(&filtered, request);
        }

        let func = cached.measure.rollup_function().ok_or_else(|| {
            CubeError::ExecutionError(format!("{} cannot be rolled up", cached.measure))
        })?;
        let measure = request.measure_name();
        let rolled = group_aggregate(
            &filtered,
            &request.dimensions,
            func,
            Some(measure.as_str()),
            &measure,
        )?;

        // SUM over no partial counts is NULL, a count over no rows is 0
        if cached.measure.func == AggregateFunction::Count {
            return zero_fill_measure(rolled);
        }
        Ok(rolled)
    }

    /// Reorder a table to the dimension order of `request`
    pub fn project(&self, table: &RecordBatch, request: &AggregationRequest) -> Result<RecordBatch> {
        let schema = table.schema();
        let indices = request
            .dimensions
            .iter()
            .cloned()
            .chain(std::iter::once(request.measure_name()))
            .map(|name| {
                schema.index_of(&name).map_err(|_| {
                    CubeError::ExecutionError(format!("Cached table has no column '{}'", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if indices.iter().copied().eq(0..table.num_columns()) {
            return Ok(table.clone());
        }
        Ok(table.project(&indices)?)
    }

    /// Give a table returned by the source the canonical column names.
    ///
    /// The source answers the SQL produced by `AggregationRequest::to_sql`, so
    /// its columns are positional: the dimensions, then the measure.
    pub fn conform(&self, table: RecordBatch, request: &AggregationRequest) -> Result<RecordBatch> {
        let expected = request.dimensions.len() + 1;
        if table.num_columns() != expected {
            return Err(CubeError::SourceDelegationFailure(format!(
                "expected {} columns from the source, got {}",
                expected,
                table.num_columns()
            )));
        }

        let names = request
            .dimensions
            .iter()
            .cloned()
            .chain(std::iter::once(request.measure_name()));
        let fields: Vec<Field> = table
            .schema()
            .fields()
            .iter()
            .zip(names)
            .map(|(field, name)| Field::new(name, field.data_type().clone(), true))
            .collect();

        Ok(RecordBatch::try_new(
            Arc::new(Schema::new(fields)),
            table.columns().to_vec(),
        )?)
    }
}

/// Replace NULLs in the trailing measure column with 0
fn zero_fill_measure(table: RecordBatch) -> Result<RecordBatch> {
    let last = table.num_columns() - 1;
    let counts = cast(table.column(last), &DataType::Int64)?;
    let filled: Int64Array = counts
        .as_primitive::<Int64Type>()
        .iter()
        .map(|v| Some(v.unwrap_or(0)))
        .collect();

    let mut columns = table.columns().to_vec();
    columns[last] = Arc::new(filled);
    Ok(RecordBatch::try_new(table.schema(), columns)?)
}
