//! Batch -> Parquet artifact materialization.
//!
//! Each call produces exactly one complete artifact or nothing: data is
//! written to a hidden temporary file in the output directory and only
//! persisted under its final name after the footer is flushed and synced.

pub mod encode;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use parquet::basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::batch::Batch;
use crate::config::{CompressionCodec, OutputConfig};
use crate::errors::PipelineError;

pub use self::schema::{ColumnSchema, ColumnType};

/// Key/value metadata keys stamped into every artifact footer.
pub const META_EXTRACT_NAME: &str = "pqextract.extract_name";
pub const META_BATCH_SEQUENCE: &str = "pqextract.batch_sequence";

/// A completed, independently readable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub sequence: u64,
    pub rows: usize,
    pub bytes: u64,
}

/// Materializes one batch as one artifact.
pub trait BatchWriter {
    /// # Errors
    ///
    /// Returns [`PipelineError::Write`] if the artifact cannot be produced.
    /// No file is left under the final name on failure.
    fn write(&self, batch: &Batch, output: &OutputConfig) -> Result<OutputArtifact, PipelineError>;
}

/// `{extract_name}_{YYYYMMDD_HHMMSS}_{sequence:04}.parquet`
#[must_use]
pub fn artifact_file_name(extract_name: &str, timestamp: NaiveDateTime, sequence: u64) -> String {
    format!(
        "{extract_name}_{}_{sequence:04}.parquet",
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

fn compression(codec: CompressionCodec) -> Compression {
    match codec {
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
        CompressionCodec::Zstd => Compression::ZSTD(ZstdLevel::default()),
        CompressionCodec::Lz4 => Compression::LZ4_RAW,
        CompressionCodec::Brotli => Compression::BROTLI(BrotliLevel::default()),
        CompressionCodec::Uncompressed => Compression::UNCOMPRESSED,
    }
}

fn writer_properties(output: &OutputConfig, sequence: u64) -> WriterProperties {
    WriterProperties::builder()
        .set_compression(compression(output.compression))
        .set_max_row_group_size(output.row_group_size.max(1))
        .set_key_value_metadata(Some(vec![
            KeyValue::new(META_EXTRACT_NAME.to_string(), output.extract_name.clone()),
            KeyValue::new(META_BATCH_SEQUENCE.to_string(), sequence.to_string()),
        ]))
        .build()
}

/// Parquet writer stamping artifacts with local wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct ParquetBatchWriter {
    clock: fn() -> NaiveDateTime,
}

impl Default for ParquetBatchWriter {
    fn default() -> Self {
        Self {
            clock: || Local::now().naive_local(),
        }
    }
}

impl ParquetBatchWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `clock` for artifact timestamps instead of the local wall clock.
    #[must_use]
    pub fn with_clock(clock: fn() -> NaiveDateTime) -> Self {
        Self { clock }
    }

    fn materialize(
        &self,
        batch: &Batch,
        output: &OutputConfig,
        dir: &Path,
        file_name: &str,
        path: &Path,
    ) -> Result<u64, PipelineError> {
        let columns = schema::infer(batch);
        let record_batch =
            encode::to_record_batch(batch, &columns).map_err(|e| PipelineError::write(path, e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| PipelineError::write(path, e))?;

        let props = writer_properties(output, batch.sequence);
        let mut writer = ArrowWriter::try_new(temp.as_file_mut(), record_batch.schema(), Some(props))
            .map_err(|e| PipelineError::write(path, e))?;
        writer
            .write(&record_batch)
            .map_err(|e| PipelineError::write(path, e))?;
        writer.close().map_err(|e| PipelineError::write(path, e))?;

        temp.as_file()
            .sync_all()
            .map_err(|e| PipelineError::write(path, e))?;
        let bytes = temp
            .as_file()
            .metadata()
            .map_err(|e| PipelineError::write(path, e))?
            .len();

        // Fails instead of replacing an existing artifact; the temp file is
        // removed when the returned error is dropped.
        temp.persist_noclobber(path)
            .map_err(|e| PipelineError::write(path, e.error))?;
        Ok(bytes)
    }
}

impl BatchWriter for ParquetBatchWriter {
    fn write(&self, batch: &Batch, output: &OutputConfig) -> Result<OutputArtifact, PipelineError> {
        let dir = output.output_directory.as_path();
        let file_name = artifact_file_name(&output.extract_name, (self.clock)(), batch.sequence);
        let path = dir.join(&file_name);

        if batch.is_empty() {
            return Err(PipelineError::write(&path, "refusing to write an empty batch"));
        }
        if file_name.contains(['/', '\\', '\0']) {
            return Err(PipelineError::write(
                &path,
                "extract name must be a single file name component",
            ));
        }

        fs::create_dir_all(dir).map_err(|e| PipelineError::write(&path, e))?;

        tracing::info!(
            "Writing {} records to {} (compression={}, row_group_size={})",
            batch.len(),
            path.display(),
            output.compression,
            output.row_group_size
        );

        let bytes = self.materialize(batch, output, dir, &file_name, &path)?;

        tracing::info!("Successfully wrote Parquet file: {}", path.display());
        Ok(OutputArtifact {
            path,
            sequence: batch.sequence,
            rows: batch.len(),
            bytes,
        })
    }
}
