#![forbid(unsafe_code)]

mod remote;
mod sqlite;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quorum_sql_domain::{hard_cut, BackendKind, Cell, ExecutionOutcome, ResultTable, TaskInstance};
use tracing::{debug, info};

pub use remote::{
    bigquery_table_from_response, snowflake_table_from_response, BigQueryBackend,
    BigQueryCredentials, SnowflakeBackend, SnowflakeCredentials,
};
pub use sqlite::{
    execute_isolated, open_read_only, run_worker, InProcessSqlite, IsolatedSqlite, WorkerCommand,
    WorkerRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{0}")]
    Query(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("worker failure: {0}")]
    Worker(String),
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv failure: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub size_limit: usize,
    pub time_limit: Duration,
    pub grace_period: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            size_limit: 30_000,
            time_limit: Duration::from_secs(300),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// One query engine handle. Implementations never panic on bad queries; every failure comes
/// back as an `error` or `timeout` outcome.
pub trait QueryBackend: Send {
    fn kind(&self) -> BackendKind;

    fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome;

    fn close(&mut self);
}

/// Where a task's queries go: the engine plus the logical id its handle is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub kind: BackendKind,
    pub key: String,
    pub db_path: Option<PathBuf>,
}

impl BackendTarget {
    /// `SQLite` targets are keyed by file path, remote ones by instance id.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be inferred or a `SQLite` task has no `db_path`.
    pub fn for_task(
        task: &TaskInstance,
        kind_override: Option<BackendKind>,
    ) -> Result<Self, BackendError> {
        let kind = match kind_override {
            Some(kind) => kind,
            None => task
                .backend_kind()
                .map_err(|err| BackendError::Connection(err.to_string()))?,
        };
        match kind {
            BackendKind::Sqlite => {
                let db_path = task.db_path.clone().ok_or_else(|| {
                    BackendError::Connection(format!(
                        "sqlite task {} has no db_path",
                        task.instance_id
                    ))
                })?;
                Ok(Self {
                    kind,
                    key: db_path.display().to_string(),
                    db_path: Some(db_path),
                })
            }
            BackendKind::Snowflake | BackendKind::BigQuery => Ok(Self {
                kind,
                key: task.instance_id.clone(),
                db_path: None,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub credentials_path: Option<PathBuf>,
    pub worker: WorkerCommand,
}

/// Logical id → owned backend handle, opened lazily and closed explicitly.
/// Each attempt thread owns its own registry.
pub struct BackendRegistry {
    config: BackendConfig,
    handles: BTreeMap<String, Box<dyn QueryBackend>>,
    executions: usize,
}

impl BackendRegistry {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            handles: BTreeMap::new(),
            executions: 0,
        }
    }

    /// Open the handle for `target` unless one is already open.
    ///
    /// # Errors
    /// Returns an error when credentials cannot be loaded or the target is incomplete.
    pub fn open(&mut self, target: &BackendTarget) -> Result<(), BackendError> {
        if self.handles.contains_key(&target.key) {
            return Ok(());
        }
        let handle: Box<dyn QueryBackend> = match target.kind {
            BackendKind::Sqlite => {
                let db_path = target.db_path.clone().ok_or_else(|| {
                    BackendError::Connection(format!("sqlite target {} has no path", target.key))
                })?;
                Box::new(IsolatedSqlite::new(db_path, self.config.worker.clone()))
            }
            BackendKind::Snowflake => {
                let credentials = SnowflakeCredentials::load(self.credentials_path()?)?;
                Box::new(SnowflakeBackend::new(target.key.clone(), credentials))
            }
            BackendKind::BigQuery => {
                let credentials = BigQueryCredentials::load(self.credentials_path()?)?;
                Box::new(BigQueryBackend::new(target.key.clone(), credentials))
            }
        };
        info!(backend = target.kind.as_str(), key = %target.key, "backend handle opened");
        self.handles.insert(target.key.clone(), handle);
        Ok(())
    }

    /// Install an already-built handle under `key`, replacing and closing any previous one.
    pub fn register(&mut self, key: impl Into<String>, handle: Box<dyn QueryBackend>) {
        if let Some(mut previous) = self.handles.insert(key.into(), handle) {
            previous.close();
        }
    }

    /// Run `query` on the handle for `target`, opening it on first use.
    pub fn execute(
        &mut self,
        target: &BackendTarget,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        self.executions += 1;
        if let Err(err) = self.open(target) {
            return ExecutionOutcome::error(&err.to_string());
        }
        match self.handles.get_mut(&target.key) {
            Some(handle) => {
                let outcome = handle.execute(query, destination, limits);
                debug!(
                    backend = target.kind.as_str(),
                    status = outcome.status.as_str(),
                    truncated = outcome.truncated,
                    "query executed"
                );
                outcome
            }
            None => ExecutionOutcome::error(&format!("no open handle for {}", target.key)),
        }
    }

    /// Close one handle; returns whether it was open.
    pub fn close(&mut self, key: &str) -> bool {
        match self.handles.remove(key) {
            Some(mut handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut handle) in std::mem::take(&mut self.handles) {
            handle.close();
        }
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of `execute` calls served, including ones that failed to open a handle.
    #[must_use]
    pub fn executions(&self) -> usize {
        self.executions
    }

    fn credentials_path(&self) -> Result<&Path, BackendError> {
        self.config
            .credentials_path
            .as_deref()
            .ok_or_else(|| BackendError::Credentials("backend.credentials_path is not set".into()))
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Rows collected under a soft byte budget: the row that crosses the budget is kept and then
/// accumulation stops.
#[derive(Debug)]
pub struct RowAccumulator {
    size_limit: usize,
    accumulated: usize,
    rows: Vec<Vec<Cell>>,
    truncated: bool,
}

impl RowAccumulator {
    #[must_use]
    pub fn new(size_limit: usize) -> Self {
        Self {
            size_limit,
            accumulated: 0,
            rows: Vec::new(),
            truncated: false,
        }
    }

    /// Add a row; returns `false` once the budget is exceeded and no more rows should be read.
    pub fn push(&mut self, row: Vec<Cell>) -> bool {
        let row_len = serialized_row_len(&row);
        self.rows.push(row);
        if self.accumulated + row_len > self.size_limit {
            self.truncated = true;
            return false;
        }
        self.accumulated += row_len;
        true
    }

    #[must_use]
    pub fn finish(self, columns: Vec<String>) -> FetchedRows {
        FetchedRows {
            table: ResultTable::new(columns, self.rows),
            truncated: self.truncated,
        }
    }
}

fn serialized_row_len(row: &[Cell]) -> usize {
    row.iter().map(|cell| cell.render().len()).sum::<usize>() + row.len()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRows {
    pub table: ResultTable,
    pub truncated: bool,
}

/// Turn fetched rows into an outcome: `empty` for zero rows, a CSV file when `destination` is
/// given, otherwise the table plus its CSV rendering hard-cut to `size_limit`.
#[must_use]
pub fn materialize(
    fetched: FetchedRows,
    destination: Option<&Path>,
    size_limit: usize,
) -> ExecutionOutcome {
    if fetched.table.is_empty() {
        return ExecutionOutcome::empty();
    }
    match destination {
        Some(path) => match write_csv(path, &fetched.table) {
            Ok(()) => ExecutionOutcome::persisted(
                path.to_path_buf(),
                fetched.table.rows.len(),
                fetched.truncated,
            ),
            Err(err) => ExecutionOutcome::error(&format!(
                "failed to write {}: {err}",
                path.display()
            )),
        },
        None => match render_csv(&fetched.table) {
            Ok(rendered) => {
                let (rendered, cut) = hard_cut(&rendered, size_limit);
                ExecutionOutcome::table(fetched.table, rendered, fetched.truncated || cut)
            }
            Err(err) => ExecutionOutcome::error(&err.to_string()),
        },
    }
}

/// Render a table as CSV text with a header row.
///
/// # Errors
/// Returns an error when the CSV writer fails.
pub fn render_csv(table: &ResultTable) -> Result<String, BackendError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_records(&mut writer, table)?;
    let bytes = writer
        .into_inner()
        .map_err(|err| BackendError::Protocol(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| BackendError::Protocol(err.to_string()))
}

/// Write a table as a CSV file with a header row.
///
/// # Errors
/// Returns an error when the file cannot be created or written.
pub fn write_csv(path: &Path, table: &ResultTable) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    write_records(&mut writer, table)?;
    writer.flush()?;
    Ok(())
}

fn write_records<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    table: &ResultTable,
) -> Result<(), BackendError> {
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(Cell::render))?;
    }
    Ok(())
}

/// Read a CSV file written by [`write_csv`] back into a typed table.
///
/// # Errors
/// Returns an error when the file is missing or not valid CSV.
pub fn read_csv_table(path: &Path) -> Result<ResultTable, BackendError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let columns = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(Cell::from_field).collect());
    }
    Ok(ResultTable::new(columns, rows))
}
