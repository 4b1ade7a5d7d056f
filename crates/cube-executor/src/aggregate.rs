use arrow::array::*;
use arrow::array::AsArray;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::{and_kleene, cast, filter_record_batch, or_kleene, take};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use cube_core::{CubeError, Result};
use cube_parser::{AggregateFunction, CompareOp, Literal, Predicate};
use std::collections::HashMap;
use std::sync::Arc;

pub fn evaluate_predicate(predicate: &Predicate, batch: &RecordBatch) -> Result<BooleanArray> {
    match predicate {
        Predicate::Comparison { column, op, value } => {
            let array = column_by_name(batch, column)?;
            let (lhs, rhs) = align_literal(&array, value)?;
            let rhs = Scalar::new(rhs);
            let result = match op {
                CompareOp::Eq => eq(&lhs, &rhs)?,
                CompareOp::NotEq => neq(&lhs, &rhs)?,
                CompareOp::Lt => lt(&lhs, &rhs)?,
                CompareOp::LtEq => lt_eq(&lhs, &rhs)?,
                CompareOp::Gt => gt(&lhs, &rhs)?,
                CompareOp::GtEq => gt_eq(&lhs, &rhs)?,
            };
            Ok(result)
        }
        Predicate::And(children) => fold_children(children, batch, true),
        Predicate::Or(children) => fold_children(children, batch, false),
    }
}

fn fold_children(children: &[Predicate], batch: &RecordBatch, conjunction: bool) -> Result<BooleanArray> {
    let mut acc = BooleanArray::from(vec![conjunction; batch.num_rows()]);
    for child in children {
        let mask = evaluate_predicate(child, batch)?;
        acc = if conjunction {
            and_kleene(&acc, &mask)?
        } else {
            or_kleene(&acc, &mask)?
        };
    }
    Ok(acc)
}

/// Rows for which the predicate is true. Unknown (NULL) counts as false.
pub fn filter_batch(batch: &RecordBatch, predicate: Option<&Predicate>) -> Result<RecordBatch> {
    match predicate {
        None => Ok(batch.clone()),
        Some(p) => {
            let mask = evaluate_predicate(p, batch)?;
            Ok(filter_record_batch(batch, &mask)?)
        }
    }
}

pub(crate) fn column_by_name(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(name)
        .cloned()
        .ok_or_else(|| CubeError::ExecutionError(format!("Unknown column '{}'", name)))
}

/// Bring a literal to the type of the column it is compared with.
///
/// Integer literals compare against integer columns widened to `Int64`, so a
/// literal outside a narrow column's range still compares correctly. Any
/// other numeric pairing compares as `Float64`; everything else casts the
/// literal to the column type, which yields NULL (never true) when the text
/// does not fit.
fn align_literal(column: &ArrayRef, value: &Literal) -> Result<(ArrayRef, ArrayRef)> {
    let column_type = column.data_type();

    if let Literal::Number(text) = value {
        if column_type.is_numeric() {
            if column_type.is_integer() {
                if let Ok(v) = text.parse::<i64>() {
                    let literal: ArrayRef = Arc::new(Int64Array::from(vec![v]));
                    return Ok((cast(column, &DataType::Int64)?, literal));
                }
            }
            let v: f64 = text
                .parse()
                .map_err(|_| CubeError::ExecutionError(format!("Invalid number '{}'", text)))?;
            let literal: ArrayRef = Arc::new(Float64Array::from(vec![v]));
            return Ok((cast(column, &DataType::Float64)?, literal));
        }
    }

    let literal: ArrayRef = match value {
        Literal::Number(text) | Literal::String(text) => {
            Arc::new(StringArray::from(vec![text.as_str()]))
        }
        Literal::Boolean(b) => Arc::new(BooleanArray::from(vec![*b])),
        Literal::Null => new_null_array(column_type, 1),
    };
    Ok((column.clone(), cast(&literal, column_type)?))
}

/// Group `batch` by `dimensions` and aggregate one value column.
///
/// Output columns are the dimensions in the given order followed by the
/// measure named `output`. Groups appear in order of first occurrence. With
/// no dimensions the whole batch is one group, even when it is empty.
pub fn group_aggregate(
    batch: &RecordBatch,
    dimensions: &[String],
    func: AggregateFunction,
    value: Option<&str>,
    output: &str,
) -> Result<RecordBatch> {
    let dim_columns = dimensions
        .iter()
        .map(|d| column_by_name(batch, d))
        .collect::<Result<Vec<_>>>()?;

    let (group_ids, first_rows) = assign_groups(&dim_columns, batch.num_rows())?;
    let num_groups = first_rows.len();

    let measure = match value {
        Some(name) => accumulate(func, &column_by_name(batch, name)?, &group_ids, num_groups)?,
        None if func == AggregateFunction::Count => {
            let mut counts = vec![0i64; num_groups];
            for &g in &group_ids {
                counts[g] += 1;
            }
            Arc::new(Int64Array::from(counts)) as ArrayRef
        }
        None => {
            return Err(CubeError::ExecutionError(format!(
                "{}(*) is not supported",
                func
            )))
        }
    };

    let indices = UInt32Array::from(first_rows);
    let mut fields = Vec::with_capacity(dimensions.len() + 1);
    let mut columns = Vec::with_capacity(dimensions.len() + 1);
    for (name, column) in dimensions.iter().zip(&dim_columns) {
        fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(take(column.as_ref(), &indices, None)?);
    }
    fields.push(Field::new(output, measure.data_type().clone(), true));
    columns.push(measure);

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Map every row to a dense group id, returning the ids and the first row of
/// each group
fn assign_groups(dim_columns: &[ArrayRef], num_rows: usize) -> Result<(Vec<usize>, Vec<u32>)> {
    if dim_columns.is_empty() {
        return Ok((vec![0; num_rows], vec![0]));
    }

    let converter = RowConverter::new(
        dim_columns
            .iter()
            .map(|c| SortField::new(c.data_type().clone()))
            .collect(),
    )?;
    let rows = converter.convert_columns(dim_columns)?;

    let mut groups = HashMap::new();
    let mut group_ids = Vec::with_capacity(num_rows);
    let mut first_rows = Vec::new();
    for i in 0..num_rows {
        let next = first_rows.len();
        let id = *groups.entry(rows.row(i)).or_insert_with(|| {
            first_rows.push(i as u32);
            next
        });
        group_ids.push(id);
    }
    Ok((group_ids, first_rows))
}

fn accumulate(
    func: AggregateFunction,
    values: &ArrayRef,
    group_ids: &[usize],
    num_groups: usize,
) -> Result<ArrayRef> {
    let data_type = values.data_type();
    match func {
        AggregateFunction::Count => {
            let mut counts = vec![0i64; num_groups];
            for (row, &g) in group_ids.iter().enumerate() {
                if values.is_valid(row) {
                    counts[g] += 1;
                }
            }
            Ok(Arc::new(Int64Array::from(counts)))
        }
        AggregateFunction::Sum if data_type.is_integer() => {
            let values = cast(values, &DataType::Int64)?;
            let values = values.as_primitive::<arrow::datatypes::Int64Type>();
            let mut sums: Vec<Option<i64>> = vec![None; num_groups];
            for (v, &g) in values.iter().zip(group_ids) {
                if let Some(v) = v {
                    let current = sums[g].unwrap_or(0);
                    sums[g] = Some(current.checked_add(v).ok_or_else(|| {
                        CubeError::ExecutionError("SUM overflowed Int64".to_string())
                    })?);
                }
            }
            Ok(Arc::new(Int64Array::from(sums)))
        }
        AggregateFunction::Sum if data_type.is_numeric() => {
            let values = float_values(values)?;
            let mut sums: Vec<Option<f64>> = vec![None; num_groups];
            for (v, &g) in values.iter().zip(group_ids) {
                if let Some(v) = v {
                    sums[g] = Some(sums[g].unwrap_or(0.0) + v);
                }
            }
            Ok(Arc::new(Float64Array::from(sums)))
        }
        AggregateFunction::Avg if data_type.is_numeric() => {
            let values = float_values(values)?;
            let mut totals = vec![(0.0f64, 0u64); num_groups];
            for (v, &g) in values.iter().zip(group_ids) {
                if let Some(v) = v {
                    totals[g].0 += v;
                    totals[g].1 += 1;
                }
            }
            let avgs: Float64Array = totals
                .into_iter()
                .map(|(sum, n)| if n > 0 { Some(sum / n as f64) } else { None })
                .collect();
            Ok(Arc::new(avgs))
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let keep_new = |ord: std::cmp::Ordering| match func {
                AggregateFunction::Min => ord.is_lt(),
                _ => ord.is_gt(),
            };
            if data_type.is_integer() {
                let values = cast(values, &DataType::Int64)?;
                let values = values.as_primitive::<arrow::datatypes::Int64Type>();
                Ok(Arc::new(Int64Array::from(extreme(values.iter(), group_ids, num_groups, |a, b| {
                    keep_new(a.cmp(b))
                }))))
            } else if data_type.is_numeric() {
                let values = float_values(values)?;
                Ok(Arc::new(Float64Array::from(extreme(values.iter(), group_ids, num_groups, |a, b| {
                    keep_new(a.total_cmp(b))
                }))))
            } else {
                let values = cast(values, &DataType::Utf8)?;
                let values = values.as_string::<i32>();
                let picked = extreme(values.iter(), group_ids, num_groups, |a, b| keep_new(a.cmp(b)));
                Ok(Arc::new(StringArray::from(picked)))
            }
        }
        _ => Err(CubeError::ExecutionError(format!(
            "{} is not supported for {} columns",
            func, data_type
        ))),
    }
}

fn float_values(values: &ArrayRef) -> Result<Float64Array> {
    let values = cast(values, &DataType::Float64)?;
    Ok(values.as_primitive::<arrow::datatypes::Float64Type>().clone())
}

/// Per-group extreme value; `replace(candidate, current)` decides whether the
/// candidate wins
fn extreme<T: Copy>(
    values: impl Iterator<Item = Option<T>>,
    group_ids: &[usize],
    num_groups: usize,
    replace: impl Fn(&T, &T) -> bool,
) -> Vec<Option<T>> {
    let mut out: Vec<Option<T>> = vec![None; num_groups];
    for (v, &g) in values.zip(group_ids) {
        if let Some(v) = v {
            match &out[g] {
                Some(current) if !replace(&v, current) => {}
                _ => out[g] = Some(v),
            }
        }
    }
    out
}
