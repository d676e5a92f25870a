//! Integration tests for the run lifecycle.
//!
//! An in-memory source stands in for the database so batch boundaries,
//! artifact output and resource release can be checked end to end.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use pqextract_engine::config::{ConnectionConfig, OutputConfig, PipelineConfig};
use pqextract_engine::source::Fetched;
use pqextract_engine::{
    Batch, BatchWriter, Orchestrator, OutputArtifact, ParquetBatchWriter, PipelineError,
    SourceConnector, SourceCursor, Value,
};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Failure {
    #[default]
    None,
    Connect,
    Query,
    /// Fail the n-th fetch call (1-based).
    Fetch(usize),
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fetches: AtomicUsize,
}

struct MemoryConnector {
    rows: usize,
    failure: Failure,
    counters: Arc<Counters>,
}

impl MemoryConnector {
    fn new(rows: usize) -> Self {
        Self {
            rows,
            failure: Failure::None,
            counters: Arc::default(),
        }
    }

    fn failing(rows: usize, failure: Failure) -> Self {
        Self {
            failure,
            ..Self::new(rows)
        }
    }
}

struct MemoryCursor {
    rows: usize,
    position: usize,
    failure: Failure,
    counters: Arc<Counters>,
    closed: bool,
}

impl SourceConnector for MemoryConnector {
    type Cursor = MemoryCursor;

    fn open(&self, _config: &ConnectionConfig) -> Result<MemoryCursor, PipelineError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.failure == Failure::Connect {
            return Err(PipelineError::Connection("server unreachable".into()));
        }
        Ok(MemoryCursor {
            rows: self.rows,
            position: 0,
            failure: self.failure,
            counters: Arc::clone(&self.counters),
            closed: false,
        })
    }
}

impl SourceCursor for MemoryCursor {
    fn execute(&mut self, query: &str) -> Result<(), PipelineError> {
        assert!(query.contains("SELECT"), "unexpected query: {query}");
        if self.failure == Failure::Query {
            return Err(PipelineError::Query("syntax error".into()));
        }
        Ok(())
    }

    fn fetch_next(&mut self, max_rows: usize) -> Result<Fetched, PipelineError> {
        let call = self.counters.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failure == Failure::Fetch(call) {
            return Err(PipelineError::Fetch("connection reset".into()));
        }
        let end = (self.position + max_rows).min(self.rows);
        if end == self.position {
            return Ok(Fetched::exhausted());
        }
        let records = (self.position..end)
            .map(|i| {
                vec![
                    Value::Int64(i64::try_from(i).unwrap()),
                    Value::Text(format!("customer-{i}")),
                ]
            })
            .collect();
        self.position = end;
        let names: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        Ok(Fetched::rows(names, records))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Records what it is asked to write; optionally fails one sequence.
#[derive(Default)]
struct RecordingWriter {
    fail_on: Option<u64>,
    written: Mutex<Vec<(u64, usize)>>,
}

impl BatchWriter for RecordingWriter {
    fn write(&self, batch: &Batch, output: &OutputConfig) -> Result<OutputArtifact, PipelineError> {
        let path = output.output_directory.join(format!("batch_{}", batch.sequence));
        if self.fail_on == Some(batch.sequence) {
            return Err(PipelineError::write(path, "disk full"));
        }
        self.written
            .lock()
            .unwrap()
            .push((batch.sequence, batch.len()));
        Ok(OutputArtifact {
            path,
            sequence: batch.sequence,
            rows: batch.len(),
            bytes: 0,
        })
    }
}

fn workspace(batch_size: usize) -> (TempDir, PipelineConfig) {
    let tmp = tempfile::tempdir().unwrap();
    let sql = tmp.path().join("query.sql");
    fs::write(&sql, "SELECT id, name FROM customers;\n").unwrap();

    let mut config = PipelineConfig::default();
    config.query.sql_file_path = sql;
    config.processing.batch_size = batch_size;
    config.output.extract_name = "Customers".into();
    config.output.output_directory = tmp.path().join("output");
    (tmp, config)
}

fn artifact_rows(path: &Path) -> usize {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
        .unwrap()
        .build()
        .unwrap();
    reader.map(|b| b.unwrap().num_rows()).sum()
}

#[test]
fn batches_are_split_into_sequenced_artifacts() {
    let (_tmp, config) = workspace(1000);
    let out_dir = config.output.output_directory.clone();
    let connector = MemoryConnector::new(2500);
    let counters = Arc::clone(&connector.counters);

    let orchestrator = Orchestrator::new(config, connector, ParquetBatchWriter::new());
    let summary = orchestrator.run().expect("run should succeed");

    assert_eq!(summary.total_records, 2500);
    assert_eq!(summary.batches_written, 3);
    assert_eq!(summary.artifact_rows(), summary.total_records);

    let suffixes: Vec<String> = summary
        .artifacts
        .iter()
        .map(|a| {
            let name = a.path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("Customers_"), "{name}");
            name[name.len() - "0001.parquet".len()..].to_string()
        })
        .collect();
    assert_eq!(suffixes, ["0001.parquet", "0002.parquet", "0003.parquet"]);

    let rows: Vec<usize> = summary.artifacts.iter().map(|a| artifact_rows(&a.path)).collect();
    assert_eq!(rows, [1000, 1000, 500]);

    let mut on_disk: Vec<PathBuf> = fs::read_dir(&out_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    on_disk.sort();
    let mut reported: Vec<PathBuf> = summary.artifacts.iter().map(|a| a.path.clone()).collect();
    reported.sort();
    assert_eq!(on_disk, reported, "no temporary files may remain");

    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_result_set_writes_nothing() {
    let (_tmp, config) = workspace(1000);
    let out_dir = config.output.output_directory.clone();
    let connector = MemoryConnector::new(0);
    let counters = Arc::clone(&connector.counters);

    let summary = Orchestrator::new(config, connector, ParquetBatchWriter::new())
        .run()
        .unwrap();

    assert_eq!(summary.total_records, 0);
    assert!(summary.artifacts.is_empty());
    assert!(!out_dir.exists());
    assert_eq!(counters.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_sql_file_aborts_before_connecting() {
    let (tmp, mut config) = workspace(1000);
    config.query.sql_file_path = tmp.path().join("nope.sql");
    let connector = MemoryConnector::new(10);
    let counters = Arc::clone(&connector.counters);
    let writer = RecordingWriter::default();

    let orchestrator = Orchestrator::new(config, connector, writer);
    let err = orchestrator.run().unwrap_err();

    assert!(matches!(err, PipelineError::SourceNotFound(_)), "{err}");
    assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
}

/// One captured log event.
#[derive(Debug, Default)]
struct Captured {
    level: Option<Level>,
    critical: bool,
    category: Option<String>,
    message: String,
}

impl Visit for Captured {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "category" {
            self.category = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<Captured>>>);

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = Captured {
            level: Some(*event.metadata().level()),
            ..Captured::default()
        };
        event.record(&mut captured);
        self.0.lock().unwrap().push(captured);
    }
}

fn run_logged<C: SourceConnector, W: BatchWriter>(
    orchestrator: &Orchestrator<C, W>,
) -> (Result<pqextract_engine::RunSummary, PipelineError>, Vec<Captured>) {
    let log = EventLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());
    let result = tracing::subscriber::with_default(subscriber, || orchestrator.run());
    let events = std::mem::take(&mut *log.0.lock().unwrap());
    (result, events)
}

#[test]
fn missing_sql_file_logs_critical_failure() {
    let (tmp, mut config) = workspace(1000);
    config.query.sql_file_path = tmp.path().join("nope.sql");
    let orchestrator = Orchestrator::new(config, MemoryConnector::new(10), RecordingWriter::default());

    let (result, events) = run_logged(&orchestrator);
    assert!(result.is_err());

    let critical: Vec<&Captured> = events.iter().filter(|e| e.critical).collect();
    assert_eq!(critical.len(), 1, "{events:?}");
    assert_eq!(critical[0].level, Some(Level::ERROR));
    assert_eq!(critical[0].category.as_deref(), Some("source_not_found"));
    assert!(
        critical[0].message.starts_with("Pipeline run failed:"),
        "{}",
        critical[0].message
    );
    assert!(critical[0].message.contains("nope.sql"), "{}", critical[0].message);
}

#[test]
fn successful_run_logs_nothing_critical() {
    let (_tmp, config) = workspace(4);
    let orchestrator = Orchestrator::new(config, MemoryConnector::new(10), RecordingWriter::default());

    let (result, events) = run_logged(&orchestrator);
    assert_eq!(result.unwrap().total_records, 10);
    assert!(events.iter().all(|e| !e.critical), "{events:?}");
    assert!(events.iter().all(|e| e.level != Some(Level::ERROR)));
}

#[test]
fn connection_failure_is_fatal_without_close() {
    let (_tmp, config) = workspace(1000);
    let connector = MemoryConnector::failing(10, Failure::Connect);
    let counters = Arc::clone(&connector.counters);

    let err = Orchestrator::new(config, connector, RecordingWriter::default())
        .run()
        .unwrap_err();

    assert_eq!(err.category(), "connection");
    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
}

#[test]
fn query_failure_still_closes_once() {
    let (_tmp, config) = workspace(1000);
    let connector = MemoryConnector::failing(10, Failure::Query);
    let counters = Arc::clone(&connector.counters);

    let err = Orchestrator::new(config, connector, RecordingWriter::default())
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::Query(_)), "{err}");
    assert_eq!(counters.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn fetch_failure_stops_after_written_batches() {
    let (_tmp, config) = workspace(100);
    let connector = MemoryConnector::failing(1000, Failure::Fetch(3));
    let counters = Arc::clone(&connector.counters);
    let orchestrator = Orchestrator::new(config, connector, RecordingWriter::default());

    let err = orchestrator.run().unwrap_err();

    assert_eq!(err.category(), "fetch");
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn write_failure_aborts_and_closes_once() {
    let (_tmp, config) = workspace(10);
    let connector = MemoryConnector::new(55);
    let counters = Arc::clone(&connector.counters);
    let writer = RecordingWriter {
        fail_on: Some(2),
        ..RecordingWriter::default()
    };
    let orchestrator = Orchestrator::new(config, connector, writer);

    let err = orchestrator.run().unwrap_err();

    assert!(matches!(err, PipelineError::Write { .. }), "{err}");
    assert_eq!(counters.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn each_run_restarts_sequencing() {
    let (_tmp, config) = workspace(4);
    let connector = MemoryConnector::new(10);
    let counters = Arc::clone(&connector.counters);
    let orchestrator = Orchestrator::new(config, connector, RecordingWriter::default());

    let first = orchestrator.run().unwrap();
    let second = orchestrator.run().unwrap();

    let seqs = |s: &pqextract_engine::RunSummary| -> Vec<u64> {
        s.artifacts.iter().map(|a| a.sequence).collect()
    };
    assert_eq!(seqs(&first), [1, 2, 3]);
    assert_eq!(seqs(&second), [1, 2, 3]);
    assert_eq!(first.total_records, 10);
    assert_eq!(second.total_records, 10);

    assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
}
