//! Configuration resolution with default substitution.
//!
//! Resolution never fails: a missing file is replaced by a persisted default
//! document, a corrupt or unreadable one by the in-memory defaults, and every
//! missing or invalid key by its documented default. Each substitution is
//! reported as a [`ConfigError`] in [`ResolvedConfig::warnings`].

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use super::{
    CompressionCodec, ConfigError, ConnectionConfig, OutputConfig, PipelineConfig,
    ProcessingConfig, QueryConfig, DEFAULT_BATCH_SIZE, DEFAULT_DATABASE, DEFAULT_EXTRACT_NAME,
    DEFAULT_OUTPUT_DIR, DEFAULT_PORT, DEFAULT_ROW_GROUP_SIZE, DEFAULT_SERVER, DEFAULT_SQL_FILE,
    DEFAULT_USER,
};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Outcome of [`resolve`]: always a usable configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: PipelineConfig,
    /// Every default substitution made along the way, in detection order.
    pub warnings: Vec<ConfigError>,
    /// Whether a default document was written to the requested path.
    pub created_default: bool,
}

impl ResolvedConfig {
    fn defaults(warnings: Vec<ConfigError>) -> Self {
        Self {
            config: PipelineConfig::default(),
            warnings,
            created_default: false,
        }
    }
}

/// Resolve the configuration stored at `path`.
///
/// When the file does not exist a default document is written there; if that
/// write fails the defaults are still returned.
pub fn resolve(path: &Path) -> ResolvedConfig {
    match std::fs::read_to_string(path) {
        Ok(text) => resolve_str(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut resolved = ResolvedConfig::defaults(vec![ConfigError::NotFound(
                path.to_path_buf(),
            )]);
            match persist_default(path, &resolved.config) {
                Ok(()) => resolved.created_default = true,
                Err(e) => resolved.warnings.push(e),
            }
            resolved
        }
        Err(e) => ResolvedConfig::defaults(vec![ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }]),
    }
}

/// Resolve a configuration from document text.
pub fn resolve_str(text: &str) -> ResolvedConfig {
    let mut warnings = Vec::new();
    let substituted = substitute_env_vars(text, &mut warnings);

    let doc = match serde_yaml::from_str::<Value>(&substituted) {
        Ok(Value::Mapping(map)) => map,
        Ok(Value::Null) => Mapping::new(),
        Ok(_) => {
            warnings.push(ConfigError::Malformed(
                "top level is not a mapping of sections".to_string(),
            ));
            return ResolvedConfig::defaults(warnings);
        }
        Err(e) => {
            warnings.push(ConfigError::Malformed(e.to_string()));
            return ResolvedConfig::defaults(warnings);
        }
    };

    let connection = read_connection(&mut Section::open(&doc, "connection", &mut warnings));
    let query = read_query(&mut Section::open(&doc, "query", &mut warnings));
    let processing = read_processing(&mut Section::open(&doc, "processing", &mut warnings));
    let output = read_output(&mut Section::open(&doc, "output", &mut warnings));

    ResolvedConfig {
        config: PipelineConfig {
            connection,
            query,
            processing,
            output,
        },
        warnings,
        created_default: false,
    }
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Unset variables are reported and left in place.
fn substitute_env_vars(input: &str, warnings: &mut Vec<ConfigError>) -> String {
    let mut result = input.to_string();
    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => result = result.replace(&cap[0], &val),
            Err(_) => warnings.push(ConfigError::MissingEnvVar(var_name.to_string())),
        }
    }
    result
}

fn persist_default(path: &Path, config: &PipelineConfig) -> Result<(), ConfigError> {
    let persist_err = |reason: String| ConfigError::Persist {
        path: path.to_path_buf(),
        reason,
    };
    let text = serde_yaml::to_string(config).map_err(|e| persist_err(e.to_string()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
    }
    std::fs::write(path, text).map_err(|e| persist_err(e.to_string()))
}

/// One section of the document plus the warning sink.
struct Section<'a> {
    name: &'static str,
    map: Option<&'a Mapping>,
    warnings: &'a mut Vec<ConfigError>,
}

impl<'a> Section<'a> {
    fn open(doc: &'a Mapping, name: &'static str, warnings: &'a mut Vec<ConfigError>) -> Self {
        let map = doc.get(name).and_then(Value::as_mapping);
        if map.is_none() {
            warnings.push(ConfigError::MissingSection(name));
        }
        Self {
            name,
            map,
            warnings,
        }
    }

    fn lookup(&self, keys: &[&str]) -> Option<&'a Value> {
        let map = self.map?;
        keys.iter()
            .filter_map(|k| map.get(*k))
            .find(|v| !v.is_null())
    }

    fn missing(&mut self, key: &'static str, default: impl ToString) {
        // An absent section was already reported as a whole.
        if self.map.is_some() {
            self.warnings.push(ConfigError::MissingKey {
                section: self.name,
                key,
                default: default.to_string(),
            });
        }
    }

    fn invalid(&mut self, key: &'static str, value: String, reason: String, default: String) {
        self.warnings.push(ConfigError::InvalidValue {
            section: self.name,
            key,
            value,
            reason,
            default,
        });
    }

    /// Required text key; falls back to `default` with a warning.
    fn text(&mut self, key: &'static str, aliases: &[&str], default: &str) -> String {
        match self.optional_text(key, aliases) {
            Some(v) => v,
            None => {
                self.missing(key, default);
                default.to_string()
            }
        }
    }

    /// Optional text key; absence is silent.
    fn optional_text(&self, key: &'static str, aliases: &[&str]) -> Option<String> {
        let keys: Vec<&str> = std::iter::once(key).chain(aliases.iter().copied()).collect();
        self.lookup(&keys).and_then(scalar_text)
    }

    /// Required positive integer key.
    fn positive(&mut self, key: &'static str, aliases: &[&str], default: usize) -> usize {
        let keys: Vec<&str> = std::iter::once(key).chain(aliases.iter().copied()).collect();
        let Some(raw) = self.lookup(&keys) else {
            self.missing(key, default);
            return default;
        };
        match parse_positive(raw) {
            Ok(n) => n,
            Err(reason) => {
                let shown = scalar_text(raw).unwrap_or_else(|| format!("{raw:?}"));
                self.invalid(key, shown, reason, default.to_string());
                default
            }
        }
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_positive(raw: &Value) -> Result<usize, String> {
    let n: i64 = match raw {
        Value::Number(n) => n.as_i64().ok_or_else(|| "not an integer".to_string())?,
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| format!("not an integer ({e})"))?,
        _ => return Err("not an integer".to_string()),
    };
    if n <= 0 {
        return Err("must be > 0".to_string());
    }
    usize::try_from(n).map_err(|e| e.to_string())
}

fn read_connection(section: &mut Section<'_>) -> ConnectionConfig {
    let server = section.text("server", &[], DEFAULT_SERVER);
    let database = section.text("database", &[], DEFAULT_DATABASE);
    let port = match section.optional_text("port", &[]) {
        None => DEFAULT_PORT,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e: std::num::ParseIntError| {
            section.invalid("port", raw.clone(), e.to_string(), DEFAULT_PORT.to_string());
            DEFAULT_PORT
        }),
    };
    let user = section
        .optional_text("user", &["username"])
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    let password = section.optional_text("password", &[]).unwrap_or_default();
    let connect_timeout_secs =
        match section.optional_text("connect_timeout_secs", &["connectTimeoutSecs"]) {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(secs),
                _ => {
                    section.invalid(
                        "connect_timeout_secs",
                        raw.clone(),
                        "must be a positive integer".to_string(),
                        "none".to_string(),
                    );
                    None
                }
            },
        };

    ConnectionConfig {
        server,
        database,
        port,
        user,
        password,
        connect_timeout_secs,
    }
}

fn read_query(section: &mut Section<'_>) -> QueryConfig {
    let sql_file_path = section.text("sql_file_path", &["sqlFilePath"], DEFAULT_SQL_FILE);
    QueryConfig {
        sql_file_path: PathBuf::from(sql_file_path),
    }
}

fn read_processing(section: &mut Section<'_>) -> ProcessingConfig {
    ProcessingConfig {
        batch_size: section.positive("batch_size", &["batchSize"], DEFAULT_BATCH_SIZE),
    }
}

fn read_output(section: &mut Section<'_>) -> OutputConfig {
    let raw_name = section.text("extract_name", &["extractName"], DEFAULT_EXTRACT_NAME);
    let extract_name = match file_name_problem(&raw_name) {
        None => raw_name,
        Some(reason) => {
            section.invalid(
                "extract_name",
                raw_name,
                reason.to_string(),
                DEFAULT_EXTRACT_NAME.to_string(),
            );
            DEFAULT_EXTRACT_NAME.to_string()
        }
    };
    let output_directory = PathBuf::from(section.text(
        "output_directory",
        &["outputDirectory"],
        DEFAULT_OUTPUT_DIR,
    ));
    let default_codec = CompressionCodec::default();
    let raw_codec = section.text("compression", &["compressionCodec"], default_codec.as_str());
    let compression = raw_codec.parse().unwrap_or_else(|e: ConfigError| {
        section.invalid(
            "compression",
            raw_codec.clone(),
            e.to_string(),
            default_codec.to_string(),
        );
        default_codec
    });
    let row_group_size =
        section.positive("row_group_size", &["rowGroupSize"], DEFAULT_ROW_GROUP_SIZE);

    OutputConfig {
        extract_name,
        output_directory,
        compression,
        row_group_size,
    }
}

/// `extract_name` is embedded in artifact and log file names, so it must
/// stay a single path component.
fn file_name_problem(name: &str) -> Option<&'static str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        Some("must not be empty")
    } else if trimmed == "." || trimmed == ".." {
        Some("must not be a relative directory name")
    } else if name.contains(['/', '\\', '\0']) {
        Some("must not contain path separators or NUL")
    } else {
        None
    }
}
