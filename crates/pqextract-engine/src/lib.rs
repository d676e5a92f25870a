//! Core extraction engine for pqextract: streams a query's result set out of
//! a relational source in bounded batches and materializes each batch as one
//! compressed Parquet artifact.

pub mod batch;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod result;
pub mod source;
pub mod writer;

// Re-export public API for convenience
pub use batch::{Batch, Record, Value};
pub use config::{resolve, PipelineConfig, ResolvedConfig};
pub use errors::{CleanupError, PipelineError};
pub use orchestrator::Orchestrator;
pub use result::RunSummary;
pub use source::{PostgresConnector, SourceConnector, SourceCursor};
pub use writer::{BatchWriter, OutputArtifact, ParquetBatchWriter};
