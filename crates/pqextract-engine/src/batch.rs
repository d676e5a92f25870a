//! In-flight data model: dynamically typed values, records and batches.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// One scalar cell as fetched from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Bytes(v) => {
                f.write_str("\\x")?;
                v.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// One row, positionally aligned with its batch's column names.
pub type Record = Vec<Value>;

/// A sequence-numbered group of records destined for exactly one artifact.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based, strictly increasing within a run.
    pub sequence: u64,
    pub column_names: Arc<[String]>,
    pub records: Vec<Record>,
}

impl Batch {
    #[must_use]
    pub fn new(sequence: u64, column_names: Arc<[String]>, records: Vec<Record>) -> Self {
        Self {
            sequence,
            column_names,
            records,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cell at (`row`, `col`); short rows read as null.
    #[must_use]
    pub fn cell(&self, row: usize, col: usize) -> &Value {
        self.records
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Value::Null)
    }
}
