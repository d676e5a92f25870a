//! Run lifecycle: load query, connect, drain the cursor batch by batch into
//! artifacts, then release the source on every exit path.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use tracing::Span;

use crate::batch::Batch;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::result::RunSummary;
use crate::source::{SourceConnector, SourceCursor};
use crate::writer::{BatchWriter, OutputArtifact};

/// Working state of one run. Created fresh by every [`Orchestrator::run`].
#[derive(Debug, Default)]
struct RunState {
    batch_sequence: u64,
    total_records: u64,
    end_of_data: bool,
    artifacts: Vec<OutputArtifact>,
}

impl RunState {
    fn next_batch(&mut self, span: &Span) -> u64 {
        self.batch_sequence += 1;
        span.record("batch_sequence", self.batch_sequence);
        self.batch_sequence
    }
}

/// Drives one extract from a [`SourceConnector`] into a [`BatchWriter`].
///
/// `run` holds no state between calls, so one instance may be run again
/// (or concurrently from several threads when `C` and `W` are `Sync`).
pub struct Orchestrator<C, W> {
    config: PipelineConfig,
    connector: C,
    writer: W,
}

impl<C, W> Orchestrator<C, W>
where
    C: SourceConnector,
    W: BatchWriter,
{
    pub fn new(config: PipelineConfig, connector: C, writer: W) -> Self {
        Self {
            config,
            connector,
            writer,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run to its terminal state.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] that moved the run into `Failed`. The
    /// error has already been logged at critical severity.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let span = tracing::info_span!("run", batch_sequence = 0u64);
        let _entered = span.enter();
        let started = Instant::now();
        tracing::info!("Starting data pipeline run...");

        let mut state = RunState::default();
        let outcome = self.execute(&mut state, &span);
        let duration_secs = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(()) => {
                debug_assert!(state.end_of_data);
                tracing::info!(
                    "Data pipeline run completed. Total records processed: {}.",
                    state.total_records
                );
                Ok(RunSummary {
                    total_records: state.total_records,
                    batches_written: state.artifacts.len() as u64,
                    artifacts: state.artifacts,
                    duration_secs,
                })
            }
            Err(err) => {
                tracing::error!(
                    critical = true,
                    category = err.category(),
                    records_written = state.total_records,
                    "Pipeline run failed: {err}"
                );
                Err(err)
            }
        };
        tracing::info!("Data pipeline execution finished.");
        result
    }

    fn execute(&self, state: &mut RunState, span: &Span) -> Result<(), PipelineError> {
        // ── 1. Query source ──────────────────────────────────────────────
        let query = load_query(&self.config.query.sql_file_path)?;

        // ── 2. Connect ───────────────────────────────────────────────────
        let conn = &self.config.connection;
        tracing::info!(
            "Connecting to database {} on server {}",
            conn.database,
            conn.server
        );
        let mut cursor = self.connector.open(conn)?;
        tracing::info!("Database connection established.");

        // ── 3. Drain, then release regardless of outcome ────────────────
        let outcome = self.drain(&mut cursor, &query, state, span);
        cursor.close();
        outcome
    }

    fn drain(
        &self,
        cursor: &mut C::Cursor,
        query: &str,
        state: &mut RunState,
        span: &Span,
    ) -> Result<(), PipelineError> {
        cursor.execute(query)?;
        tracing::info!("SQL query executed.");

        let batch_size = self.config.processing.batch_size;
        tracing::info!("Using batch size: {batch_size}");

        while !state.end_of_data {
            let sequence = state.next_batch(span);
            tracing::info!("Processing batch {sequence}...");

            let fetched = cursor.fetch_next(batch_size)?;
            if fetched.exhausted || fetched.records.is_empty() {
                tracing::info!("No data in batch {sequence}, end of data reached.");
                state.end_of_data = true;
                continue;
            }

            let batch = Batch::new(sequence, fetched.column_names, fetched.records);
            let artifact = self.writer.write(&batch, &self.config.output)?;
            state.total_records += artifact.rows as u64;
            tracing::info!(
                "Batch {sequence} written. Total records processed so far: {}",
                state.total_records
            );
            state.artifacts.push(artifact);
        }
        Ok(())
    }
}

/// Read the run's query text.
///
/// # Errors
///
/// [`PipelineError::SourceNotFound`] if the file is missing,
/// [`PipelineError::SourceRead`] if it cannot be read and
/// [`PipelineError::EmptyQuery`] if it holds no statement.
pub fn load_query(path: &Path) -> Result<String, PipelineError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PipelineError::SourceNotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(PipelineError::SourceRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().trim_end_matches(';').trim().is_empty() {
        return Err(PipelineError::EmptyQuery(path.to_path_buf()));
    }
    tracing::info!("Successfully read SQL query from {}", path.display());
    Ok(text)
}
