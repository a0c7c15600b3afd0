#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use quorum_sql_domain::{
    now_utc, AttemptRecord, BackendKind, ConsensusDecision, EventRow, GeneratorCallRecord,
    ProfileSnapshotRecord, RunId, RunRecord, RunStatus, TaskRunId, TaskRunRecord, TaskStatus,
    TraceEvent, TraceEventType,
};
use quorum_sql_trace_core::TraceStore;
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const TRACE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_snapshots (
  profile_hash TEXT PRIMARY KEY,
  normalization_version INTEGER NOT NULL,
  source_yaml_hash TEXT NOT NULL,
  normalized_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  profile_name TEXT NOT NULL,
  profile_version TEXT NOT NULL,
  profile_hash TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','succeeded','failed')),
  engine_version TEXT NOT NULL,
  cli_args_json TEXT NOT NULL,
  FOREIGN KEY (profile_hash) REFERENCES profile_snapshots(profile_hash)
);

CREATE TABLE IF NOT EXISTS task_runs (
  task_run_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  instance_id TEXT NOT NULL,
  backend TEXT,
  output_dir TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT CHECK (status IS NULL OR status IN ('finalized','abstained','no_candidates','skipped','failed')),
  UNIQUE(run_id, instance_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  task_run_id TEXT NOT NULL,
  attempt_index INTEGER NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('succeeded','abandoned','exhausted')),
  abandon_reason TEXT,
  iterations INTEGER NOT NULL,
  candidate_count INTEGER NOT NULL,
  final_sql TEXT,
  reused INTEGER NOT NULL CHECK (reused IN (0,1)),
  record_json TEXT NOT NULL,
  UNIQUE(task_run_id, attempt_index),
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (task_run_id) REFERENCES task_runs(task_run_id)
);

CREATE TABLE IF NOT EXISTS generator_calls (
  call_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  task_run_id TEXT NOT NULL,
  attempt_index INTEGER,
  generator_name TEXT NOT NULL,
  model_id TEXT NOT NULL,
  request_hash TEXT NOT NULL,
  response_hash TEXT NOT NULL,
  latency_ms INTEGER,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  status TEXT NOT NULL,
  error_text TEXT,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (task_run_id) REFERENCES task_runs(task_run_id)
);

CREATE TABLE IF NOT EXISTS consensus_decisions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  task_run_id TEXT NOT NULL UNIQUE,
  winner_attempt INTEGER,
  vote_count INTEGER NOT NULL,
  support INTEGER NOT NULL,
  tie INTEGER NOT NULL CHECK (tie IN (0,1)),
  resolution TEXT NOT NULL,
  votes_json TEXT NOT NULL,
  decided_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (task_run_id) REFERENCES task_runs(task_run_id)
);

CREATE TABLE IF NOT EXISTS trace_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  task_run_id TEXT,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor_type TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (task_run_id) REFERENCES task_runs(task_run_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_events_run_seq ON trace_events(run_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_task_runs_run ON task_runs(run_id, instance_id);
CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_run_id, attempt_index);
CREATE INDEX IF NOT EXISTS idx_generator_calls_task ON generator_calls(task_run_id, started_at);

CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_update
BEFORE UPDATE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_delete
BEFORE DELETE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_attempts_no_update
BEFORE UPDATE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_attempts_no_delete
BEFORE DELETE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_generator_calls_no_update
BEFORE UPDATE ON generator_calls
BEGIN
  SELECT RAISE(FAIL, 'generator_calls is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_generator_calls_no_delete
BEFORE DELETE ON generator_calls
BEGIN
  SELECT RAISE(FAIL, 'generator_calls is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_consensus_decisions_no_update
BEFORE UPDATE ON consensus_decisions
BEGIN
  SELECT RAISE(FAIL, 'consensus_decisions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_consensus_decisions_no_delete
BEFORE DELETE ON consensus_decisions
BEGIN
  SELECT RAISE(FAIL, 'consensus_decisions is append-only');
END;
";

pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` run ledger and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Number of attempt rows recorded for a task run.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn count_attempts(&self, task_run_id: TaskRunId) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM attempts WHERE task_run_id = ?1",
                params![task_run_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to count attempts")?;
        usize::try_from(count).map_err(|_| anyhow!("negative attempt count"))
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply trace schema")?;

        let now = format_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACE_SCHEMA_VERSION, now],
            )
            .context("failed to record trace migration")?;

        Ok(())
    }

    fn upsert_profile_snapshot(
        &self,
        profile_hash: &str,
        normalization_version: u32,
        source_yaml_hash: &str,
        normalized_json: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO profile_snapshots(
                    profile_hash, normalization_version, source_yaml_hash,
                    normalized_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(profile_hash) DO UPDATE SET
                    normalization_version = excluded.normalization_version,
                    source_yaml_hash = excluded.source_yaml_hash,
                    normalized_json = excluded.normalized_json",
                params![
                    profile_hash,
                    i64::from(normalization_version),
                    source_yaml_hash,
                    serde_json::to_string(normalized_json)?,
                    format_timestamp(now_utc())?,
                ],
            )
            .context("failed to upsert profile snapshot")?;
        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, profile_name, profile_version, profile_hash,
                    started_at, ended_at, status, engine_version, cli_args_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.run_id.to_string(),
                    run.profile_name,
                    run.profile_version,
                    run.profile_hash,
                    format_timestamp(run.started_at)?,
                    run.ended_at.map(format_timestamp).transpose()?,
                    run.status.as_str(),
                    run.engine_version,
                    serde_json::to_string(&run.cli_args_json)?,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn update_run_finished(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?2, ended_at = ?3 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    format_timestamp(now_utc())?
                ],
            )
            .context("failed to update run status")?;
        Ok(())
    }

    fn insert_task_run(&self, task_run: &TaskRunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_runs(
                    task_run_id, run_id, instance_id, backend, output_dir,
                    started_at, ended_at, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task_run.task_run_id.to_string(),
                    task_run.run_id.to_string(),
                    task_run.instance_id,
                    task_run.backend.map(BackendKind::as_str),
                    task_run.output_dir,
                    format_timestamp(task_run.started_at)?,
                    task_run.ended_at.map(format_timestamp).transpose()?,
                    task_run.status.map(TaskStatus::as_str),
                ],
            )
            .context("failed to insert task run")?;
        Ok(())
    }

    fn update_task_finished(&self, task_run_id: TaskRunId, status: TaskStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE task_runs SET status = ?2, ended_at = ?3 WHERE task_run_id = ?1",
                params![
                    task_run_id.to_string(),
                    status.as_str(),
                    format_timestamp(now_utc())?
                ],
            )
            .context("failed to update task run status")?;
        Ok(())
    }

    fn append_attempt(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO attempts(
                    run_id, task_run_id, attempt_index, state, abandon_reason,
                    iterations, candidate_count, final_sql, reused, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id.to_string(),
                    task_run_id.to_string(),
                    to_sql_int(attempt.attempt_index, "attempt_index")?,
                    attempt.state.as_str(),
                    attempt.abandon_reason.as_ref().map(ToString::to_string),
                    to_sql_int(attempt.iterations, "iterations")?,
                    to_sql_int(attempt.candidates.len(), "candidate_count")?,
                    attempt.final_sql,
                    i64::from(attempt.reused),
                    serde_json::to_string(attempt)?,
                ],
            )
            .context("failed to append attempt")?;
        Ok(())
    }

    fn append_generator_call(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        attempt_index: Option<usize>,
        call: &GeneratorCallRecord,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO generator_calls(
                    call_id, run_id, task_run_id, attempt_index, generator_name,
                    model_id, request_hash, response_hash, latency_ms,
                    started_at, ended_at, status, error_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    call.call_id.to_string(),
                    run_id.to_string(),
                    task_run_id.to_string(),
                    attempt_index
                        .map(|index| to_sql_int(index, "attempt_index"))
                        .transpose()?,
                    call.generator_name,
                    call.model_id,
                    call.request_hash,
                    call.response_hash,
                    call.latency_ms
                        .map(|value| {
                            i64::try_from(value).map_err(|_| anyhow!("latency_ms too large"))
                        })
                        .transpose()?,
                    format_timestamp(call.started_at)?,
                    format_timestamp(call.ended_at)?,
                    call.status,
                    call.error_text,
                ],
            )
            .context("failed to append generator call")?;
        Ok(())
    }

    fn append_consensus(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        decision: &ConsensusDecision,
        votes: &[usize],
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO consensus_decisions(
                    run_id, task_run_id, winner_attempt, vote_count, support,
                    tie, resolution, votes_json, decided_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id.to_string(),
                    task_run_id.to_string(),
                    decision
                        .winner
                        .map(|winner| to_sql_int(winner, "winner_attempt"))
                        .transpose()?,
                    to_sql_int(decision.vote_count, "vote_count")?,
                    to_sql_int(decision.support, "support")?,
                    i64::from(decision.tie),
                    decision.resolution.as_str(),
                    serde_json::to_string(votes)?,
                    format_timestamp(now_utc())?,
                ],
            )
            .context("failed to append consensus decision")?;
        Ok(())
    }

    fn append_event(&self, event: &TraceEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO trace_events(
                    event_id, run_id, task_run_id, event_type,
                    occurred_at, recorded_at, actor_type, actor_id,
                    payload_json, payload_hash, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.event_id.to_string(),
                    event.run_id.to_string(),
                    event.task_run_id.map(|id| id.to_string()),
                    event.event_type.as_str(),
                    format_timestamp(event.occurred_at)?,
                    format_timestamp(now_utc())?,
                    event.actor_type,
                    event.actor_id,
                    serde_json::to_string(&event.payload_json)?,
                    event.payload_hash,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append trace event")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, profile_name, profile_version, profile_hash,
                started_at, ended_at, status, engine_version, cli_args_json
             FROM runs
             ORDER BY started_at DESC, run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                event_seq, event_id, run_id, task_run_id, event_type,
                occurred_at, actor_type, actor_id,
                payload_json, payload_hash, prev_event_hash, event_hash
             FROM trace_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let run_id_raw: String = row.get(2)?;
            let task_run_id_raw: Option<String> = row.get(3)?;
            let payload_raw: String = row.get(8)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: TraceEvent {
                    event_id: parse_ulid(&event_id_raw, "event_id")?,
                    run_id: RunId(parse_ulid(&run_id_raw, "run_id")?),
                    task_run_id: task_run_id_raw
                        .map(|value| parse_ulid(&value, "task_run_id").map(TaskRunId))
                        .transpose()?,
                    event_type: TraceEventType::parse(&row.get::<_, String>(4)?)?,
                    occurred_at: parse_timestamp(&row.get::<_, String>(5)?)?,
                    actor_type: row.get(6)?,
                    actor_id: row.get(7)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(9)?,
                    prev_event_hash: row.get(10)?,
                    event_hash: row.get(11)?,
                },
            });
        }

        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, profile_name, profile_version, profile_hash,
                started_at, ended_at, status, engine_version, cli_args_json
             FROM runs
             WHERE run_id = ?1",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_task_runs(&self, run_id: RunId) -> Result<Vec<TaskRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                task_run_id, run_id, instance_id, backend, output_dir,
                started_at, ended_at, status
             FROM task_runs
             WHERE run_id = ?1
             ORDER BY instance_id ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(TaskRunRecord {
                task_run_id: TaskRunId(parse_ulid(&row.get::<_, String>(0)?, "task_run_id")?),
                run_id: RunId(parse_ulid(&row.get::<_, String>(1)?, "run_id")?),
                instance_id: row.get(2)?,
                backend: row
                    .get::<_, Option<String>>(3)?
                    .map(|value| BackendKind::parse(&value))
                    .transpose()?,
                output_dir: row.get(4)?,
                started_at: parse_timestamp(&row.get::<_, String>(5)?)?,
                ended_at: row
                    .get::<_, Option<String>>(6)?
                    .map(|value| parse_timestamp(&value))
                    .transpose()?,
                status: row
                    .get::<_, Option<String>>(7)?
                    .map(|value| TaskStatus::parse(&value))
                    .transpose()?,
            });
        }
        Ok(out)
    }

    fn get_profile_snapshot(&self, profile_hash: &str) -> Result<Option<ProfileSnapshotRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT profile_hash, normalization_version, source_yaml_hash, normalized_json
                 FROM profile_snapshots
                 WHERE profile_hash = ?1",
                params![profile_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to load profile snapshot")?;

        found
            .map(|(profile_hash, version, source_yaml_hash, normalized)| {
                Ok(ProfileSnapshotRecord {
                    profile_hash,
                    normalization_version: u32::try_from(version)
                        .map_err(|_| anyhow!("invalid normalization_version: {version}"))?,
                    source_yaml_hash,
                    normalized_json: serde_json::from_str(&normalized)
                        .context("invalid normalized_json")?,
                })
            })
            .transpose()
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<RunRecord> {
    let run_id_str: String = row.get(0)?;
    let cli_args_json: String = row.get(8)?;
    Ok(RunRecord {
        run_id: RunId(parse_ulid(&run_id_str, "run_id")?),
        profile_name: row.get(1)?,
        profile_version: row.get(2)?,
        profile_hash: row.get(3)?,
        started_at: parse_timestamp(&row.get::<_, String>(4)?)?,
        ended_at: row
            .get::<_, Option<String>>(5)?
            .map(|value| parse_timestamp(&value))
            .transpose()?,
        status: RunStatus::parse(&row.get::<_, String>(6)?)?,
        engine_version: row.get(7)?,
        cli_args_json: serde_json::from_str(&cli_args_json).context("invalid cli_args_json")?,
    })
}

fn to_sql_int(value: usize, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{field} too large for sqlite"))
}

fn parse_ulid(value: &str, field: &str) -> Result<Ulid> {
    Ulid::from_str(value).map_err(|err| anyhow!("invalid {field} ULID: {err}"))
}

fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
