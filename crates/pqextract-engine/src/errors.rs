//! Run-level error model.
//!
//! [`PipelineError`] covers every condition that aborts a run. Recoverable
//! configuration problems live in [`crate::config::ConfigError`] and never
//! reach this type; cursor release problems are [`CleanupError`] and are
//! only ever logged.

use std::path::PathBuf;

/// Fatal error that moves a run into its `Failed` terminal state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configured SQL source file does not exist.
    #[error("SQL source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// The SQL source file exists but could not be read.
    #[error("failed to read SQL source file {}: {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The SQL source file holds no statement.
    #[error("SQL source file {} contains no query", .0.display())]
    EmptyQuery(PathBuf),

    /// The data source could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The query was rejected or failed to start.
    #[error("query execution failed: {0}")]
    Query(String),

    /// A bounded fetch from the open cursor failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// An artifact could not be materialized.
    #[error("failed to write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    /// Anything else.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl PipelineError {
    /// Build a [`PipelineError::Write`] from any displayable cause.
    pub fn write(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Operator-facing category name, used in critical log lines.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::SourceNotFound(_) => "source_not_found",
            Self::SourceRead { .. } | Self::EmptyQuery(_) => "source_invalid",
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Fetch(_) => "fetch",
            Self::Write { .. } => "write",
            Self::Unexpected(_) => "unexpected",
        }
    }

    /// Whether the error was raised before any connection attempt.
    #[must_use]
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound(_) | Self::SourceRead { .. } | Self::EmptyQuery(_)
        )
    }
}

/// Failure while releasing the cursor or connection.
///
/// Never escalated: callers log it at warning level and move on.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cursor close failed: {0}")]
    Cursor(String),

    #[error("transaction end failed: {0}")]
    Transaction(String),

    #[error("connection close failed: {0}")]
    Connection(String),
}
