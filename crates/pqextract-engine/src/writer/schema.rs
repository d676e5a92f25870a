//! Per-batch columnar schema inference.
//!
//! Every value of every column is inspected; a batch is bounded by the
//! configured batch size so the full scan is the sample.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, TimeUnit};

use crate::batch::{Batch, Value};

/// Logical column type chosen for one batch column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampTz,
}

impl ColumnType {
    fn of(value: &Value) -> Option<Self> {
        let ty = match value {
            Value::Null => return None,
            Value::Bool(_) => Self::Boolean,
            Value::Int16(_) => Self::Int16,
            Value::Int32(_) => Self::Int32,
            Value::Int64(_) => Self::Int64,
            Value::Float32(_) => Self::Float32,
            Value::Float64(_) => Self::Float64,
            Value::Text(_) => Self::Utf8,
            Value::Bytes(_) => Self::Binary,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::Timestamp(_) => Self::Timestamp,
            Value::TimestampTz(_) => Self::TimestampTz,
        };
        Some(ty)
    }

    fn int_rank(self) -> Option<u8> {
        match self {
            Self::Int16 => Some(1),
            Self::Int32 => Some(2),
            Self::Int64 => Some(3),
            _ => None,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Smallest type able to hold values of both `self` and `other`.
    #[must_use]
    pub fn widen(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        match (self.int_rank(), other.int_rank()) {
            (Some(a), Some(b)) => return if a >= b { self } else { other },
            (Some(_), None) if other.is_float() => return Self::Float64,
            (None, Some(_)) if self.is_float() => return Self::Float64,
            _ => {}
        }
        if self.is_float() && other.is_float() {
            return Self::Float64;
        }
        Self::Utf8
    }

    #[must_use]
    pub fn data_type(self) -> DataType {
        match self {
            Self::Boolean => DataType::Boolean,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
            Self::Utf8 => DataType::Utf8,
            Self::Binary => DataType::Binary,
            Self::Date => DataType::Date32,
            Self::Time => DataType::Time64(TimeUnit::Microsecond),
            Self::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            Self::TimestampTz => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Infer one [`ColumnSchema`] per column of `batch`.
///
/// A column that holds only nulls becomes nullable UTF-8.
#[must_use]
pub fn infer(batch: &Batch) -> Vec<ColumnSchema> {
    batch
        .column_names
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let mut observed: Option<ColumnType> = None;
            let mut nullable = false;
            for row in 0..batch.len() {
                match ColumnType::of(batch.cell(row, col)) {
                    None => nullable = true,
                    Some(ty) => observed = Some(observed.map_or(ty, |seen| seen.widen(ty))),
                }
            }
            ColumnSchema {
                name: name.clone(),
                column_type: observed.unwrap_or(ColumnType::Utf8),
                nullable: nullable || observed.is_none(),
            }
        })
        .collect()
}

#[must_use]
pub fn arrow_schema(columns: &[ColumnSchema]) -> Arc<Schema> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, c.column_type.data_type(), c.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}
