//! Typed extract configuration and its recoverable error model.
//!
//! A [`PipelineConfig`] is resolved once per run by [`resolver::resolve`]
//! and shared read-only by every component afterwards.

pub mod resolver;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Serialize, Serializer};

pub use resolver::{resolve, resolve_str, ResolvedConfig};

pub const DEFAULT_SERVER: &str = "localhost\\SQLEXPRESS";
pub const DEFAULT_DATABASE: &str = "master";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_SQL_FILE: &str = "query.sql";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_EXTRACT_NAME: &str = "DataExtract";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10_000;

/// Fully resolved configuration for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineConfig {
    pub connection: ConnectionConfig,
    pub query: QueryConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
}

/// Where the data source lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    pub server: String,
    pub database: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryConfig {
    pub sql_file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingConfig {
    pub batch_size: usize,
}

/// Naming and physical layout of produced artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputConfig {
    pub extract_name: String,
    pub output_directory: PathBuf,
    pub compression: CompressionCodec,
    pub row_group_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            connect_timeout_secs: None,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sql_file_path: PathBuf::from(DEFAULT_SQL_FILE),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            extract_name: DEFAULT_EXTRACT_NAME.to_string(),
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIR),
            compression: CompressionCodec::default(),
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }
}

/// Physical compression applied to artifact column chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionCodec {
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
    Brotli,
    Uncompressed,
}

impl CompressionCodec {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snappy => "snappy",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
            Self::Brotli => "brotli",
            Self::Uncompressed => "none",
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(Self::Snappy),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "lz4" | "lz4_raw" => Ok(Self::Lz4),
            "brotli" => Ok(Self::Brotli),
            "none" | "uncompressed" => Ok(Self::Uncompressed),
            _ => Err(ConfigError::UnknownCodec(s.to_string())),
        }
    }
}

impl Serialize for CompressionCodec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A configuration problem that was recovered by substituting a default.
///
/// None of these abort a run; the resolver collects them so the caller can
/// log them once logging is available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}; using defaults", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read config file {}: {reason}; using defaults", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("malformed config document: {0}; using defaults")]
    Malformed(String),

    #[error("failed to persist default config to {}: {reason}", path.display())]
    Persist { path: PathBuf, reason: String },

    #[error("missing config section [{0}]; added defaults")]
    MissingSection(&'static str),

    #[error("missing key {section}.{key}; using default {default}")]
    MissingKey {
        section: &'static str,
        key: &'static str,
        default: String,
    },

    #[error("invalid {section}.{key} '{value}': {reason}; using default {default}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
        default: String,
    },

    #[error("unknown compression codec '{0}'")]
    UnknownCodec(String),

    #[error("environment variable {0} is not set; reference left verbatim")]
    MissingEnvVar(String),
}
