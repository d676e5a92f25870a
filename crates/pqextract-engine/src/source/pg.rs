//! `PostgreSQL` source over a server-side cursor.
//!
//! Lifecycle: connect -> `BEGIN READ ONLY` -> `DECLARE ... NO SCROLL CURSOR`
//! -> repeated `FETCH FORWARD n` -> `CLOSE` + `COMMIT` (or `ROLLBACK` after a
//! failure) -> client close.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use postgres::{Client, Config as PgConfig, NoTls};

use super::{unique_column_names, Fetched, SourceConnector, SourceCursor};
use crate::batch::{Record, Value};
use crate::config::ConnectionConfig;
use crate::errors::{CleanupError, PipelineError};

/// Server-side cursor name used for streaming reads.
const CURSOR_NAME: &str = "pqx_cursor";

const APPLICATION_NAME: &str = "pqextract";

/// Host and port derived from the configured `server` string.
///
/// Accepts `host`, `host:port`, `host,port` and an optional `\INSTANCE`
/// suffix on the host, which has no `PostgreSQL` meaning and is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub instance: Option<String>,
}

impl ConnectionTarget {
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let server = config.server.trim();
        let (addr, port) = split_port(server);
        let (host, instance) = match addr.split_once('\\') {
            Some((host, instance)) => (host, Some(instance.to_string())),
            None => (addr, None),
        };
        let host = if host.is_empty() { "localhost" } else { host };
        Self {
            host: host.to_string(),
            port: port.unwrap_or(config.port),
            database: config.database.clone(),
            instance,
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

fn split_port(server: &str) -> (&str, Option<u16>) {
    if let Some((addr, port)) = server.rsplit_once(',') {
        if let Ok(port) = port.trim().parse() {
            return (addr.trim(), Some(port));
        }
    }
    if let Some((addr, port)) = server.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon; leave it alone.
        if !addr.contains(':') {
            if let Ok(port) = port.parse() {
                return (addr, Some(port));
            }
        }
    }
    (server, None)
}

/// Opens [`PostgresCursor`]s with the synchronous `postgres` client.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

impl SourceConnector for PostgresConnector {
    type Cursor = PostgresCursor;

    fn open(&self, config: &ConnectionConfig) -> Result<PostgresCursor, PipelineError> {
        let target = ConnectionTarget::from_config(config);
        if let Some(instance) = &target.instance {
            tracing::debug!(instance = %instance, "Ignoring named instance suffix in server");
        }

        let mut pg = PgConfig::new();
        pg.host(&target.host)
            .port(target.port)
            .user(&config.user)
            .dbname(&config.database)
            .application_name(APPLICATION_NAME);
        if !config.password.is_empty() {
            pg.password(&config.password);
        }
        if let Some(secs) = config.connect_timeout_secs {
            pg.connect_timeout(Duration::from_secs(secs));
        }

        let client = pg
            .connect(NoTls)
            .map_err(|e| PipelineError::Connection(format!("{target}: {e}")))?;
        Ok(PostgresCursor::new(client))
    }
}

/// One connection plus one forward-only cursor.
pub struct PostgresCursor {
    client: Option<Client>,
    in_transaction: bool,
    declared: bool,
    /// Set once any statement inside the transaction fails.
    failed: bool,
    exhausted: bool,
    column_names: Option<Arc<[String]>>,
}

impl PostgresCursor {
    fn new(client: Client) -> Self {
        Self {
            client: Some(client),
            in_transaction: false,
            declared: false,
            failed: false,
            exhausted: false,
            column_names: None,
        }
    }

    fn client(&mut self) -> Option<&mut Client> {
        self.client.as_mut()
    }
}

impl SourceCursor for PostgresCursor {
    fn execute(&mut self, query: &str) -> Result<(), PipelineError> {
        let query = query.trim().trim_end_matches(';').trim_end();
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| PipelineError::Query("connection already closed".to_string()))?;

        client
            .batch_execute("BEGIN READ ONLY")
            .map_err(|e| PipelineError::Query(format!("BEGIN failed: {e}")))?;
        self.in_transaction = true;

        let declare = format!("DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {query}");
        if let Err(e) = client.batch_execute(&declare) {
            self.failed = true;
            return Err(PipelineError::Query(format!("DECLARE CURSOR failed: {e}")));
        }
        self.declared = true;
        Ok(())
    }

    fn fetch_next(&mut self, max_rows: usize) -> Result<Fetched, PipelineError> {
        if self.exhausted {
            return Ok(Fetched::exhausted());
        }
        if !self.declared {
            return Err(PipelineError::Fetch("no query has been executed".to_string()));
        }
        let fetch = format!("FETCH FORWARD {max_rows} FROM {CURSOR_NAME}");
        let client = self
            .client()
            .ok_or_else(|| PipelineError::Fetch("connection already closed".to_string()))?;

        let fetched = client.prepare(&fetch).and_then(|stmt| {
            let rows = client.query(&stmt, &[])?;
            Ok((stmt, rows))
        });
        let (stmt, rows) = match fetched {
            Ok(v) => v,
            Err(e) => {
                self.failed = true;
                return Err(PipelineError::Fetch(format!("FETCH failed: {e}")));
            }
        };

        if rows.is_empty() {
            self.exhausted = true;
            tracing::info!("No more rows to fetch from database.");
            return Ok(Fetched::exhausted());
        }

        let names = match &self.column_names {
            Some(names) => Arc::clone(names),
            None => {
                let (names, renamed) =
                    unique_column_names(stmt.columns().iter().map(|c| c.name().to_string()));
                if renamed {
                    tracing::warn!(
                        columns = %names.join(", "),
                        "Duplicate result column names were made unique"
                    );
                }
                self.column_names = Some(Arc::clone(&names));
                names
            }
        };

        let mut records: Vec<Record> = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = (0..row.len())
                .map(|i| row.try_get::<_, Value>(i))
                .collect::<Result<Record, _>>()
                .map_err(|e| {
                    self.failed = true;
                    PipelineError::Fetch(format!("failed to decode row: {e}"))
                })?;
            records.push(record);
        }

        tracing::info!("Fetched {} rows in this batch.", records.len());
        Ok(Fetched::rows(names, records))
    }

    fn close(&mut self) {
        let Some(mut client) = self.client.take() else {
            return;
        };

        if self.declared && !self.failed {
            match client.batch_execute(&format!("CLOSE {CURSOR_NAME}")) {
                Ok(()) => tracing::info!("Database cursor closed."),
                Err(e) => {
                    self.failed = true;
                    tracing::warn!("{}", CleanupError::Cursor(e.to_string()));
                }
            }
        }

        if self.in_transaction {
            // ROLLBACK also drops the cursor when CLOSE was skipped.
            let end = if self.failed { "ROLLBACK" } else { "COMMIT" };
            if let Err(e) = client.batch_execute(end) {
                tracing::warn!("{}", CleanupError::Transaction(format!("{end}: {e}")));
            }
        }

        match client.close() {
            Ok(()) => tracing::info!("Database connection closed."),
            Err(e) => tracing::warn!("{}", CleanupError::Connection(e.to_string())),
        }
    }
}
