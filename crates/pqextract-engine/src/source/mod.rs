//! Forward-only source cursors.
//!
//! A [`SourceConnector`] opens exactly one connection per run and hands back
//! a [`SourceCursor`] that owns it. The cursor executes one query and is then
//! drained through bounded [`SourceCursor::fetch_next`] calls.

mod decode;
pub mod pg;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::batch::Record;
use crate::config::ConnectionConfig;
use crate::errors::PipelineError;

pub use self::pg::{ConnectionTarget, PostgresConnector, PostgresCursor};

/// Result of one bounded fetch.
///
/// Data and exhaustion are mutually exclusive: an exhausted fetch carries no
/// records, and a fetch with records is never flagged exhausted.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub records: Vec<Record>,
    pub column_names: Arc<[String]>,
    pub exhausted: bool,
}

impl Fetched {
    /// The terminal, empty fetch.
    #[must_use]
    pub fn exhausted() -> Self {
        Self {
            records: Vec::new(),
            column_names: Arc::from(Vec::<String>::new()),
            exhausted: true,
        }
    }

    /// A non-terminal fetch. `records` must not be empty.
    #[must_use]
    pub fn rows(column_names: Arc<[String]>, records: Vec<Record>) -> Self {
        debug_assert!(!records.is_empty(), "a data fetch must carry rows");
        Self {
            records,
            column_names,
            exhausted: false,
        }
    }
}

/// Opens cursors against a data source.
pub trait SourceConnector {
    type Cursor: SourceCursor;

    /// Establish the run's single connection.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Connection`] if the source is unreachable.
    fn open(&self, config: &ConnectionConfig) -> Result<Self::Cursor, PipelineError>;
}

/// A single forward-only cursor plus the connection it lives on.
pub trait SourceCursor {
    /// Execute the run's query and position the cursor before its first row.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Query`] if the query is rejected.
    fn execute(&mut self, query: &str) -> Result<(), PipelineError>;

    /// Fetch up to `max_rows` rows.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Fetch`] on any I/O or decode failure. Not
    /// retried.
    fn fetch_next(&mut self, max_rows: usize) -> Result<Fetched, PipelineError>;

    /// Release the cursor and the connection.
    ///
    /// Must be idempotent and must not fail: problems are logged as warnings.
    fn close(&mut self);
}

/// Make result column names unique by suffixing repeats with `_2`, `_3`, ...
///
/// Returns the names and whether any were renamed.
pub fn unique_column_names<I>(names: I) -> (Arc<[String]>, bool)
where
    I: IntoIterator<Item = String>,
{
    let names: Vec<String> = names.into_iter().collect();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut taken: HashSet<String> = names.iter().cloned().collect();
    let mut renamed = false;
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            out.push(name);
            continue;
        }
        renamed = true;
        let mut n = *count;
        let mut candidate = format!("{name}_{n}");
        while taken.contains(&candidate) {
            n += 1;
            candidate = format!("{name}_{n}");
        }
        *count = n;
        taken.insert(candidate.clone());
        out.push(candidate);
    }

    (out.into(), renamed)
}
