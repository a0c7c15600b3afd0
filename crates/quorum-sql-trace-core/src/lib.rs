#![forbid(unsafe_code)]

use anyhow::Result;
use quorum_sql_domain::{
    AttemptRecord, ConsensusDecision, EventRow, GeneratorCallRecord, ProfileSnapshotRecord, RunId,
    RunRecord, RunStatus, TaskRunId, TaskRunRecord, TaskStatus, TraceEvent,
};

pub trait TraceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_profile_snapshot(
        &self,
        profile_hash: &str,
        normalization_version: u32,
        source_yaml_hash: &str,
        normalized_json: &serde_json::Value,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_run_finished(&self, run_id: RunId, status: RunStatus) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_task_run(&self, task_run: &TaskRunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_task_finished(&self, task_run_id: TaskRunId, status: TaskStatus) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_attempt(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        attempt: &AttemptRecord,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_generator_call(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        attempt_index: Option<usize>,
        call: &GeneratorCallRecord,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_consensus(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        decision: &ConsensusDecision,
        votes: &[usize],
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &TraceEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_task_runs(&self, run_id: RunId) -> Result<Vec<TaskRunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_profile_snapshot(&self, profile_hash: &str) -> Result<Option<ProfileSnapshotRecord>>;
}
