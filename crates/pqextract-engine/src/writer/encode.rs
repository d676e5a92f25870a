//! Row-oriented [`Batch`] -> Arrow [`RecordBatch`].

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, StringArray, Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{Datelike, NaiveTime, Timelike};

use super::schema::{arrow_schema, ColumnSchema, ColumnType};
use crate::batch::{Batch, Value};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Encode `batch` using the inferred `columns`.
///
/// # Errors
///
/// Fails if a value does not fit its column's inferred type, which only
/// happens when `columns` was not inferred from this batch.
pub fn to_record_batch(batch: &Batch, columns: &[ColumnSchema]) -> Result<RecordBatch, ArrowError> {
    let schema = arrow_schema(columns);
    let arrays = columns
        .iter()
        .enumerate()
        .map(|(col, c)| encode_column(batch, col, c))
        .collect::<Result<Vec<ArrayRef>, _>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(batch.len()));
    RecordBatch::try_new_with_options(schema, arrays, &options)
}

fn encode_column(batch: &Batch, col: usize, column: &ColumnSchema) -> Result<ArrayRef, ArrowError> {
    let array: ArrayRef = match column.column_type {
        ColumnType::Boolean => Arc::new(BooleanArray::from(collect(batch, col, column, |v| {
            match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            }
        })?)),
        ColumnType::Int16 => Arc::new(Int16Array::from(collect(batch, col, column, |v| {
            match v {
                Value::Int16(i) => Some(*i),
                _ => None,
            }
        })?)),
        ColumnType::Int32 => Arc::new(Int32Array::from(collect(batch, col, column, |v| {
            match v {
                Value::Int16(i) => Some(i32::from(*i)),
                Value::Int32(i) => Some(*i),
                _ => None,
            }
        })?)),
        ColumnType::Int64 => Arc::new(Int64Array::from(collect(batch, col, column, as_i64)?)),
        ColumnType::Float32 => Arc::new(Float32Array::from(collect(batch, col, column, |v| {
            match v {
                Value::Float32(f) => Some(*f),
                _ => None,
            }
        })?)),
        ColumnType::Float64 => Arc::new(Float64Array::from(collect(batch, col, column, as_f64)?)),
        ColumnType::Utf8 => Arc::new(StringArray::from(collect(batch, col, column, |v| {
            Some(v.to_string())
        })?)),
        ColumnType::Binary => {
            let values = collect(batch, col, column, |v| match v {
                Value::Bytes(b) => Some(b.as_slice()),
                _ => None,
            })?;
            Arc::new(BinaryArray::from_opt_vec(values))
        }
        ColumnType::Date => Arc::new(Date32Array::from(collect(batch, col, column, |v| {
            match v {
                Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                _ => None,
            }
        })?)),
        ColumnType::Time => Arc::new(Time64MicrosecondArray::from(collect(
            batch,
            col,
            column,
            |v| match v {
                Value::Time(t) => Some(time_micros(*t)),
                _ => None,
            },
        )?)),
        ColumnType::Timestamp => Arc::new(TimestampMicrosecondArray::from(collect(
            batch,
            col,
            column,
            |v| match v {
                Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                _ => None,
            },
        )?)),
        ColumnType::TimestampTz => Arc::new(
            TimestampMicrosecondArray::from(collect(batch, col, column, |v| match v {
                Value::TimestampTz(ts) => Some(ts.timestamp_micros()),
                _ => None,
            })?)
            .with_timezone("UTC"),
        ),
    };
    Ok(array)
}

/// Gather one column; `extract` returns `None` for a value of the wrong kind.
fn collect<'a, T>(
    batch: &'a Batch,
    col: usize,
    column: &ColumnSchema,
    extract: impl Fn(&'a Value) -> Option<T>,
) -> Result<Vec<Option<T>>, ArrowError> {
    (0..batch.len())
        .map(|row| {
            let value = batch.cell(row, col);
            if value.is_null() {
                return Ok(None);
            }
            extract(value).map(Some).ok_or_else(|| {
                ArrowError::InvalidArgumentError(format!(
                    "column '{}' row {row}: {value:?} does not fit {:?}",
                    column.name, column.column_type
                ))
            })
        })
        .collect()
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int16(i) => Some(i64::from(*i)),
        Value::Int32(i) => Some(i64::from(*i)),
        Value::Int64(i) => Some(*i),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float32(f) => Some(f64::from(*f)),
        Value::Float64(f) => Some(*f),
        other => as_i64(other).map(|i| i as f64),
    }
}

fn time_micros(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1_000_000 + i64::from(t.nanosecond() / 1_000)
}
