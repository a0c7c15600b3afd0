use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use quorum_sql_domain::{BackendKind, Cell, ExecutionOutcome};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{materialize, BackendError, ExecutionLimits, FetchedRows, QueryBackend, RowAccumulator};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CANCEL_LINE: &str = "cancel";

/// Open a database file read-only through a `file:` URI.
///
/// # Errors
/// Returns an error when the file is missing or cannot be opened.
pub fn open_read_only(path: &Path) -> Result<Connection, BackendError> {
    let uri = format!("file:{}?mode=ro", path.display());
    Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| BackendError::Connection(format!("{}: {err}", path.display())))
}

fn fetch(conn: &Connection, query: &str, size_limit: usize) -> Result<FetchedRows, BackendError> {
    let query_error = |err: rusqlite::Error| BackendError::Query(err.to_string());
    let mut stmt = conn.prepare(query).map_err(query_error)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let column_count = columns.len();

    let mut rows = stmt.query([]).map_err(query_error)?;
    let mut accumulator = RowAccumulator::new(size_limit);
    while let Some(row) = rows.next().map_err(query_error)? {
        let mut cells = Vec::with_capacity(column_count);
        for index in 0..column_count {
            cells.push(cell_from_value(row.get_ref(index).map_err(query_error)?));
        }
        if !accumulator.push(cells) {
            break;
        }
    }
    Ok(accumulator.finish(columns))
}

fn cell_from_value(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(value) => Cell::Integer(value),
        ValueRef::Real(value) => Cell::Real(value),
        ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Cell::Text(hex::encode(bytes)),
    }
}

/// A read-only connection used inside the worker process.
pub struct InProcessSqlite {
    path: PathBuf,
    conn: Option<Connection>,
}

impl InProcessSqlite {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, conn: None }
    }

    /// Open the connection now instead of on first query.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened read-only.
    pub fn connect(&mut self) -> Result<&Connection, BackendError> {
        if self.conn.is_none() {
            self.conn = Some(open_read_only(&self.path)?);
        }
        self.conn
            .as_ref()
            .ok_or_else(|| BackendError::Connection(self.path.display().to_string()))
    }

    pub fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        size_limit: usize,
    ) -> ExecutionOutcome {
        let fetched = match self.connect() {
            Ok(conn) => fetch(conn, query, size_limit),
            Err(err) => Err(err),
        };
        match fetched {
            Ok(fetched) => materialize(fetched, destination, size_limit),
            Err(err) => ExecutionOutcome::error(&err.to_string()),
        }
    }
}

/// Runs on the caller's thread with no deadline; the worker process and trusted local fixtures
/// use it directly.
impl QueryBackend for InProcessSqlite {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        InProcessSqlite::execute(self, query, destination, limits.size_limit)
    }

    fn close(&mut self) {
        self.conn = None;
    }
}

/// One query shipped to the worker as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerRequest {
    pub query: String,
    pub destination: Option<PathBuf>,
    pub size_limit: usize,
}

/// Serve one request inside the worker process: read a [`WorkerRequest`] line, execute it with a
/// fresh read-only connection, and write the outcome as one JSON line. A later `cancel` line on
/// `input` interrupts the running statement.
///
/// # Errors
/// Returns an error when the request cannot be read or the outcome cannot be written.
pub fn run_worker<R, W>(db_path: &Path, input: R, mut output: W) -> Result<(), BackendError>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let mut lines = input.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| BackendError::Worker("no request on stdin".to_string()))??;
    let request: WorkerRequest = serde_json::from_str(&request_line)
        .map_err(|err| BackendError::Protocol(err.to_string()))?;

    let mut sqlite = InProcessSqlite::new(db_path.to_path_buf());
    let outcome = match sqlite.connect() {
        Ok(conn) => {
            let handle = conn.get_interrupt_handle();
            thread::spawn(move || {
                for line in lines {
                    match line {
                        Ok(line) if line.trim() == CANCEL_LINE => {
                            handle.interrupt();
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
            sqlite.execute(
                &request.query,
                request.destination.as_deref(),
                request.size_limit,
            )
        }
        Err(err) => ExecutionOutcome::error(&err.to_string()),
    };

    let encoded =
        serde_json::to_string(&outcome).map_err(|err| BackendError::Protocol(err.to_string()))?;
    writeln!(output, "{encoded}")?;
    output.flush()?;
    Ok(())
}

/// How to launch the worker process; `--db <path>` is appended per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    #[must_use]
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// The running executable's `sqlite-worker` subcommand.
    ///
    /// # Errors
    /// Returns an error when the current executable path is unavailable.
    pub fn current_exe() -> Result<Self, BackendError> {
        Ok(Self::sqlite_worker(std::env::current_exe()?))
    }

    #[must_use]
    pub fn sqlite_worker(program: PathBuf) -> Self {
        Self::new(program, vec!["sqlite-worker".to_string()])
    }
}

/// Run one query in a separate worker process under a hard deadline.
///
/// On expiry the worker is asked to cancel, given `grace_period` to exit, then killed. The call
/// returns within `time_limit + grace_period` plus polling slack.
pub fn execute_isolated(
    worker: &WorkerCommand,
    db_path: &Path,
    query: &str,
    destination: Option<&Path>,
    limits: &ExecutionLimits,
) -> ExecutionOutcome {
    match run_with_deadline(worker, db_path, query, destination, limits) {
        Ok(outcome) => outcome,
        Err(err) => ExecutionOutcome::error(&err.to_string()),
    }
}

fn run_with_deadline(
    worker: &WorkerCommand,
    db_path: &Path,
    query: &str,
    destination: Option<&Path>,
    limits: &ExecutionLimits,
) -> Result<ExecutionOutcome, BackendError> {
    let deadline = Instant::now() + limits.time_limit;
    let mut child = Command::new(&worker.program)
        .args(&worker.args)
        .arg("--db")
        .arg(db_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            BackendError::Worker(format!(
                "failed to spawn {}: {err}",
                worker.program.display()
            ))
        })?;

    let Some(mut stdin) = child.stdin.take() else {
        terminate(&mut child, None, limits.grace_period);
        return Err(BackendError::Worker("worker stdin unavailable".to_string()));
    };
    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child, Some(stdin), limits.grace_period);
        return Err(BackendError::Worker("worker stdout unavailable".to_string()));
    };

    let request = WorkerRequest {
        query: query.to_string(),
        destination: destination.map(Path::to_path_buf),
        size_limit: limits.size_limit,
    };
    let encoded =
        serde_json::to_string(&request).map_err(|err| BackendError::Protocol(err.to_string()))?;
    if let Err(err) = writeln!(stdin, "{encoded}").and_then(|()| stdin.flush()) {
        terminate(&mut child, Some(stdin), limits.grace_period);
        return Err(BackendError::Worker(format!("failed to send request: {err}")));
    }

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = String::new();
        let result = BufReader::new(stdout)
            .read_to_string(&mut buffer)
            .map(|_| buffer);
        let _ = sender.send(result);
    });

    match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(Ok(output)) => {
            if !wait_until(&mut child, deadline + limits.grace_period) {
                terminate(&mut child, Some(stdin), Duration::ZERO);
            }
            parse_worker_output(&output)
        }
        Ok(Err(err)) => {
            terminate(&mut child, Some(stdin), limits.grace_period);
            Err(BackendError::Io(err))
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                db = %db_path.display(),
                time_limit_ms = u64::try_from(limits.time_limit.as_millis()).unwrap_or(u64::MAX),
                "query exceeded its deadline; cancelling worker"
            );
            terminate(&mut child, Some(stdin), limits.grace_period);
            Ok(ExecutionOutcome::timeout(query))
        }
        Err(RecvTimeoutError::Disconnected) => {
            terminate(&mut child, Some(stdin), limits.grace_period);
            Err(BackendError::Worker("worker output reader exited".to_string()))
        }
    }
}

fn parse_worker_output(output: &str) -> Result<ExecutionOutcome, BackendError> {
    let line = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| BackendError::Worker("worker exited without an outcome".to_string()))?;
    serde_json::from_str(line).map_err(|err| BackendError::Protocol(err.to_string()))
}

/// Poll until the child exits or `deadline` passes; returns whether it exited.
fn wait_until(child: &mut Child, deadline: Instant) -> bool {
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Ok(None) | Err(_) => return false,
        }
    }
}

/// Cooperative cancel first, then an unconditional kill once `grace` runs out.
fn terminate(child: &mut Child, stdin: Option<ChildStdin>, grace: Duration) {
    if let Some(mut stdin) = stdin {
        let _ = writeln!(stdin, "{CANCEL_LINE}").and_then(|()| stdin.flush());
    }
    if wait_until(child, Instant::now() + grace) {
        debug!("worker exited after cancel");
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
    debug!("worker killed after grace period");
}

/// `SQLite` handle whose queries always run in a fresh worker process.
pub struct IsolatedSqlite {
    db_path: PathBuf,
    worker: WorkerCommand,
}

impl IsolatedSqlite {
    #[must_use]
    pub fn new(db_path: PathBuf, worker: WorkerCommand) -> Self {
        Self { db_path, worker }
    }
}

impl QueryBackend for IsolatedSqlite {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        execute_isolated(&self.worker, &self.db_path, query, destination, limits)
    }

    fn close(&mut self) {}
}
