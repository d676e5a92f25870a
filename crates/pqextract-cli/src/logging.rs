//! Run logging: one timestamped file per run plus the console, both using
//! the `{timestamp} - Batch {n} - {LEVEL} - {message}` line format.
//!
//! The batch number comes from the `batch_sequence` field of the enclosing
//! `run` span, which the orchestrator re-records on every increment.

use std::fmt::{self, Write as _};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use chrono::{Local, NaiveDateTime};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self as fmt_layer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";
const SEQUENCE_FIELD: &str = "batch_sequence";
const CRITICAL_FIELD: &str = "critical";
const FALLBACK_LOG: &str = "critical_error.log";

/// `data_pipeline_{extract_name}_{YYYYMMDD_HHMMSS}.log`
pub fn log_file_name(extract_name: &str, started: NaiveDateTime) -> String {
    format!(
        "data_pipeline_{extract_name}_{}.log",
        started.format("%Y%m%d_%H%M%S")
    )
}

/// Install the global subscriber. Returns the run's log file path.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init(log_dir: &Path, extract_name: &str, level: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(log_file_name(extract_name, Local::now().naive_local()));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(BatchSequenceLayer)
        .with(
            fmt_layer::layer()
                .event_format(PipelineFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .with(
            fmt_layer::layer()
                .event_format(PipelineFormat)
                .with_writer(std::io::stdout),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(path)
}

/// Best-effort record of a failure that happened without working logging.
///
/// Appends to `{log_dir}/critical_error.log`; if even that fails the entry
/// goes to stderr.
pub fn write_fallback(log_dir: &Path, category: &str, message: &str) {
    let path = log_dir.join(FALLBACK_LOG);
    let line = format!(
        "{} - CRITICAL - {category} - {message}\n",
        Local::now().format(TIMESTAMP_FORMAT)
    );
    let appended = fs::create_dir_all(log_dir)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&path))
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = appended {
        eprintln!("Failed to write {}: {e}", path.display());
        eprint!("{line}");
    }
}

/// Batch sequence last recorded on a span.
#[derive(Debug, Clone, Copy)]
struct BatchSequence(u64);

#[derive(Default)]
struct SequenceVisitor(Option<u64>);

impl Visit for SequenceVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == SEQUENCE_FIELD {
            self.0 = Some(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == SEQUENCE_FIELD {
            self.0 = u64::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

/// Keeps each span's current `batch_sequence` in its extensions.
pub struct BatchSequenceLayer;

impl<S> Layer<S> for BatchSequenceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = SequenceVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(sequence), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(BatchSequence(sequence));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = SequenceVisitor::default();
        values.record(&mut visitor);
        let (Some(sequence), Some(span)) = (visitor.0, ctx.span(id)) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<BatchSequence>() {
            Some(current) => current.0 = sequence,
            None => extensions.insert(BatchSequence(sequence)),
        }
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    critical: bool,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == CRITICAL_FIELD {
            self.critical = value;
        } else {
            self.extra.push((field.name(), value.to_string()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.extra.push((field.name(), format!("{value:?}")));
        }
    }
}

fn level_name(level: Level, critical: bool) -> &'static str {
    match level {
        Level::ERROR if critical => "CRITICAL",
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

/// Event formatter producing the pipeline log line.
pub struct PipelineFormat;

impl<S, N> FormatEvent<S, N> for PipelineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let sequence = ctx
            .event_scope()
            .and_then(|mut scope| {
                scope.find_map(|span| {
                    let extensions = span.extensions();
                    extensions.get::<BatchSequence>().map(|s| s.0)
                })
            })
            .unwrap_or(0);

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let mut line = format!(
            "{} - Batch {sequence} - {} - {}",
            Local::now().format(TIMESTAMP_FORMAT),
            level_name(*event.metadata().level(), fields.critical),
            fields.message
        );
        for (key, value) in &fields.extra {
            write!(line, " {key}={value}")?;
        }
        writeln!(writer, "{line}")
    }
}

/// In-memory capture of formatted log lines for unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    /// Run `f` under the pipeline formatter and return the lines it logged.
    pub(crate) fn capture(f: impl FnOnce()) -> Vec<String> {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::registry().with(BatchSequenceLayer).with(
            fmt_layer::layer()
                .event_format(PipelineFormat)
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, f);
        buf.lines()
    }

    /// Split a line into its timestamp and the rest, checking the stamp shape.
    pub(crate) fn strip_timestamp(line: &str) -> &str {
        let (ts, rest) = line.split_once(" - ").expect("separator");
        assert_eq!(ts.len(), 23, "timestamp {ts}");
        assert_eq!(&ts[19..20], ",");
        assert!(NaiveDateTime::parse_from_str(&ts[..19], "%Y-%m-%d %H:%M:%S").is_ok());
        rest
    }
}
