#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Marker reported by a backend when a query result was written to its destination.
pub const SUCCESS_MARKER: &str = "0";
/// Prefix carried by every backend error message.
pub const ERROR_SENTINEL: &str = "##ERROR##";
/// Text reported when a query ran cleanly but selected nothing.
pub const EMPTY_RESULT_TEXT: &str = "No data found for the specified query.\n";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskRunId(pub Ulid);

impl TaskRunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CandidateId(pub Ulid);

impl CandidateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// # Errors
    /// Returns an error for unknown status text.
    pub fn parse(value: &str) -> Result<Self> {
        [Self::Running, Self::Succeeded, Self::Failed]
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| anyhow!("unknown run status: {value}"))
    }
}

/// Terminal status of one task instance inside a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Finalized,
    Abstained,
    NoCandidates,
    Skipped,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finalized => "finalized",
            Self::Abstained => "abstained",
            Self::NoCandidates => "no_candidates",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// # Errors
    /// Returns an error for unknown status text.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "finalized" => Ok(Self::Finalized),
            "abstained" => Ok(Self::Abstained),
            "no_candidates" => Ok(Self::NoCandidates),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    RunStarted,
    RunFinished,
    ProfileNormalized,
    TaskStarted,
    TaskSkipped,
    GeneratorCalled,
    AttemptFinished,
    ConsensusResolved,
    JudgeEscalated,
    ArtifactsFinalized,
    TaskFinished,
    Warning,
    Error,
}

impl TraceEventType {
    pub const ALL: [Self; 13] = [
        Self::RunStarted,
        Self::RunFinished,
        Self::ProfileNormalized,
        Self::TaskStarted,
        Self::TaskSkipped,
        Self::GeneratorCalled,
        Self::AttemptFinished,
        Self::ConsensusResolved,
        Self::JudgeEscalated,
        Self::ArtifactsFinalized,
        Self::TaskFinished,
        Self::Warning,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunFinished => "run_finished",
            Self::ProfileNormalized => "profile_normalized",
            Self::TaskStarted => "task_started",
            Self::TaskSkipped => "task_skipped",
            Self::GeneratorCalled => "generator_called",
            Self::AttemptFinished => "attempt_finished",
            Self::ConsensusResolved => "consensus_resolved",
            Self::JudgeEscalated => "judge_escalated",
            Self::ArtifactsFinalized => "artifacts_finalized",
            Self::TaskFinished => "task_finished",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// # Errors
    /// Returns an error for unknown event type text.
    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == value)
            .ok_or_else(|| anyhow!("unknown event_type: {value}"))
    }
}

/// The closed set of query engines a task can run against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Snowflake,
    BigQuery,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Snowflake => "snowflake",
            Self::BigQuery => "big_query",
        }
    }

    /// # Errors
    /// Returns an error for unknown backend names.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "sqlite" => Ok(Self::Sqlite),
            "snowflake" => Ok(Self::Snowflake),
            "big_query" | "bigquery" => Ok(Self::BigQuery),
            other => Err(anyhow!(
                "unsupported backend '{other}'; supported backends are 'sqlite', 'snowflake' and 'big_query'"
            )),
        }
    }

    /// Infer the backend from a task instance id prefix (`local…`, `sf…`/`fnf…`, `bq…`/`ga…`).
    #[must_use]
    pub fn from_instance_id(instance_id: &str) -> Option<Self> {
        if instance_id.starts_with("local") {
            Some(Self::Sqlite)
        } else if instance_id.starts_with("sf") || instance_id.starts_with("fnf") {
            Some(Self::Snowflake)
        } else if instance_id.starts_with("bq") || instance_id.starts_with("ga") {
            Some(Self::BigQuery)
        } else {
            None
        }
    }

    /// Dialect name used when asking for queries.
    #[must_use]
    pub fn dialect(self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Snowflake => "Snowflake",
            Self::BigQuery => "BigQuery",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GeneratorBinding {
    pub provider_name: String,
    pub model_id: String,
    #[serde(default)]
    pub params: Value,
}

/// One natural-language task to answer with a query.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskInstance {
    pub instance_id: String,
    pub question: String,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub schema_text: Option<String>,
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    #[serde(default)]
    pub format_hint: Option<String>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

impl TaskInstance {
    /// Resolve the backend: explicit override first, then the instance id prefix.
    ///
    /// # Errors
    /// Returns an error when neither source names a backend.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.backend
            .or_else(|| BackendKind::from_instance_id(&self.instance_id))
            .ok_or_else(|| {
                anyhow!(
                    "cannot infer backend for instance {}; set `backend` explicitly",
                    self.instance_id
                )
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    Generated,
    Corrected,
}

/// One query text produced for an attempt. Never mutated after execution.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Candidate {
    pub candidate_id: CandidateId,
    pub text: String,
    pub origin: CandidateOrigin,
    pub attempt_index: usize,
    pub iteration_index: usize,
}

impl Candidate {
    #[must_use]
    pub fn new(
        text: impl Into<String>,
        origin: CandidateOrigin,
        attempt_index: usize,
        iteration_index: usize,
    ) -> Self {
        Self {
            candidate_id: CandidateId::new(),
            text: text.into(),
            origin,
            attempt_index,
            iteration_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Type a raw delimited field the way it reads: blank is null, then integer, real, text.
    #[must_use]
    pub fn from_field(field: &str) -> Self {
        if field.is_empty() {
            return Self::Null;
        }
        if let Ok(value) = field.parse::<i64>() {
            return Self::Integer(value);
        }
        if let Ok(value) = field.parse::<f64>() {
            if value.is_finite() {
                return Self::Real(value);
            }
        }
        Self::Text(field.to_string())
    }

    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(value) => value.to_string(),
            Self::Real(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            Self::Null | Self::Text(_) => None,
        }
    }
}

/// Ordered column names plus ordered rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    /// `(rows, columns)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of one column in row order; short rows yield `Null`.
    #[must_use]
    pub fn column(&self, index: usize) -> Vec<Cell> {
        self.rows
            .iter()
            .map(|row| row.get(index).cloned().unwrap_or(Cell::Null))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Empty,
    Timeout,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Empty => "empty",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomePayload {
    Table { table: ResultTable, rendered: String },
    Persisted { path: PathBuf, rows: usize },
    Message { text: String },
    None,
}

/// Result of running one query. Only backends construct these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub payload: OutcomePayload,
    pub truncated: bool,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn table(table: ResultTable, rendered: String, truncated: bool) -> Self {
        Self {
            status: ExecutionStatus::Success,
            payload: OutcomePayload::Table { table, rendered },
            truncated,
        }
    }

    #[must_use]
    pub fn persisted(path: PathBuf, rows: usize, truncated: bool) -> Self {
        Self {
            status: ExecutionStatus::Success,
            payload: OutcomePayload::Persisted { path, rows },
            truncated,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: ExecutionStatus::Empty,
            payload: OutcomePayload::None,
            truncated: false,
        }
    }

    /// Wrap a backend-native message, prefixing the error sentinel.
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self {
            status: ExecutionStatus::Error,
            payload: OutcomePayload::Message {
                text: format!("{ERROR_SENTINEL}{message}"),
            },
            truncated: false,
        }
    }

    #[must_use]
    pub fn timeout(query: &str) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            payload: OutcomePayload::Message {
                text: format!("{ERROR_SENTINEL} {query} Timed out\n"),
            },
            truncated: false,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// The text a consumer sees: success marker, rendered rows, empty sentinel, or error text.
    #[must_use]
    pub fn signal(&self) -> String {
        match (&self.status, &self.payload) {
            (ExecutionStatus::Success, OutcomePayload::Table { rendered, .. }) => rendered.clone(),
            (ExecutionStatus::Success, _) => SUCCESS_MARKER.to_string(),
            (ExecutionStatus::Empty, _) => EMPTY_RESULT_TEXT.to_string(),
            (_, OutcomePayload::Message { text }) => text.clone(),
            (ExecutionStatus::Error | ExecutionStatus::Timeout, _) => ERROR_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
}

/// Append-only, role-tagged exchange log owned by one generator session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: ConversationRole, content: impl Into<String>) {
        self.turns.push(ConversationTurn {
            role,
            content: content.into(),
        });
    }

    /// Drop every turn.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[must_use]
    pub fn total_chars(&self) -> usize {
        self.turns
            .iter()
            .map(|turn| turn.content.chars().count())
            .sum()
    }

    #[must_use]
    pub fn last_assistant(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role == ConversationRole::Assistant)
            .map(|turn| turn.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorCallRecord {
    pub call_id: Ulid,
    pub generator_name: String,
    pub model_id: String,
    pub request_hash: String,
    pub response_hash: String,
    pub latency_ms: Option<u64>,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
    pub status: String,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Succeeded,
    Abandoned,
    Exhausted,
}

impl AttemptState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Abandoned => "abandoned",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    #[error("consecutive failures reached the streak limit without any success")]
    FailureStreak,
    #[error("recent executions all returned empty results")]
    EarlyStop,
    #[error("generator did not return exactly one query block")]
    MalformedResponse,
    #[error("generator call failed: {0}")]
    GeneratorFailure(String),
    #[error("query could not be persisted: {0}")]
    Persistence(String),
    #[error("attempt thread panicked")]
    Panicked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutedCandidate {
    pub candidate_id: CandidateId,
    pub outcome: ExecutionOutcome,
}

/// Full history and terminal state of one refinement attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt_index: usize,
    pub state: AttemptState,
    pub abandon_reason: Option<AbandonReason>,
    pub candidates: Vec<Candidate>,
    pub executions: Vec<ExecutedCandidate>,
    pub generator_calls: Vec<GeneratorCallRecord>,
    pub iterations: usize,
    pub final_sql: Option<String>,
    pub reused: bool,
}

impl AttemptRecord {
    #[must_use]
    pub fn new(attempt_index: usize) -> Self {
        Self {
            attempt_index,
            state: AttemptState::Exhausted,
            abandon_reason: None,
            candidates: Vec::new(),
            executions: Vec::new(),
            generator_calls: Vec::new(),
            iterations: 0,
            final_sql: None,
            reused: false,
        }
    }

    pub fn abandon(&mut self, reason: AbandonReason) {
        self.state = AttemptState::Abandoned;
        self.abandon_reason = Some(reason);
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == AttemptState::Succeeded
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusResolution {
    Majority,
    Judge,
    PickFirst,
    Abstained,
    NoCandidates,
}

impl ConsensusResolution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Judge => "judge",
            Self::PickFirst => "pick_first",
            Self::Abstained => "abstained",
            Self::NoCandidates => "no_candidates",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsensusDecision {
    pub winner: Option<usize>,
    pub vote_count: usize,
    pub support: usize,
    pub tie: bool,
    pub resolution: ConsensusResolution,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub task_run_id: Option<TaskRunId>,
    pub event_type: TraceEventType,
    pub occurred_at: DateTimeUtc,
    pub actor_type: String,
    pub actor_id: String,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub profile_name: String,
    pub profile_version: String,
    pub profile_hash: String,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: RunStatus,
    pub engine_version: String,
    pub cli_args_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskRunRecord {
    pub task_run_id: TaskRunId,
    pub run_id: RunId,
    pub instance_id: String,
    /// Absent when the task failed before its backend was resolved.
    pub backend: Option<BackendKind>,
    pub output_dir: String,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProfileSnapshotRecord {
    pub profile_hash: String,
    pub normalization_version: u32,
    pub source_yaml_hash: String,
    pub normalized_json: Value,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Cut `text` to at most `max_chars` characters, appending a newline when anything was dropped.
/// Returns the (possibly cut) text and whether a cut happened.
#[must_use]
pub fn hard_cut(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => {
            let mut cut = text[..byte_index].to_string();
            cut.push('\n');
            (cut, true)
        }
        None => (text.to_string(), false),
    }
}
