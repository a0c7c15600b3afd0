#![forbid(unsafe_code)]

mod answer_format;
mod artifacts;
mod attempt_log;
mod correction;
mod exploration;
mod judge;
mod pool;
pub mod prompts;
mod refinement;
mod runner;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use quorum_sql_backend::{BackendConfig, BackendRegistry};
use quorum_sql_domain::{
    hash_json, now_utc, ConsensusResolution, EventRow, GeneratorCallRecord, RunId, RunRecord,
    RunStatus, TaskInstance, TaskRunId, TaskRunRecord, TaskStatus, TraceEvent, TraceEventType,
};
use quorum_sql_profile::RunProfileEnvelope;
use quorum_sql_provider::GeneratorFactory;
use quorum_sql_trace_core::TraceStore;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use ulid::Ulid;

pub use artifacts::{AttemptPaths, TaskArtifacts};
pub use attempt_log::AttemptLog;
pub use correction::{correct, request_single_block, select_longest, CorrectionOutcome, Session};
pub use judge::GeneratorJudge;
pub use pool::{PoolReport, TaskContext, VotingPool};
pub use refinement::RefinementController;
pub use runner::{execution_limits, load_schema, TaskOutcome, TaskRunner};

/// Hands each attempt a fresh backend registry of its own.
pub trait BackendProvider: Sync {
    fn open_registry(&self) -> BackendRegistry;
}

impl BackendProvider for BackendConfig {
    fn open_registry(&self) -> BackendRegistry {
        BackendRegistry::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: Option<RunId>,
    pub output_dir: PathBuf,
    pub force_revote: bool,
    pub num_workers: Option<usize>,
    pub cli_args_json: Value,
    pub engine_version: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            output_dir: PathBuf::from("output"),
            force_revote: false,
            num_workers: None,
            cli_args_json: Value::Object(Map::default()),
            engine_version: "quorum-sql.v0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskTally {
    pub tasks: usize,
    pub finalized: usize,
    pub abstained: usize,
    pub no_candidates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub generator_calls: usize,
    pub backend_calls: usize,
}

impl TaskTally {
    fn count(&mut self, outcome: &TaskOutcome) {
        self.tasks += 1;
        match outcome.status {
            TaskStatus::Finalized => self.finalized += 1,
            TaskStatus::Abstained => self.abstained += 1,
            TaskStatus::NoCandidates => self.no_candidates += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Failed => self.failed += 1,
        }
        self.generator_calls += outcome
            .attempts
            .iter()
            .map(|attempt| {
                if attempt.reused {
                    0
                } else {
                    attempt.generator_calls.len()
                }
            })
            .sum::<usize>()
            + outcome.format_calls.len()
            + outcome.judge_calls.len();
        self.backend_calls += outcome.backend_calls;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tally: TaskTally,
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
}

pub struct Orchestrator<'a> {
    trace_store: &'a dyn TraceStore,
    generators: &'a dyn GeneratorFactory,
    backends: &'a dyn BackendProvider,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        trace_store: &'a dyn TraceStore,
        generators: &'a dyn GeneratorFactory,
        backends: &'a dyn BackendProvider,
    ) -> Self {
        Self {
            trace_store,
            generators,
            backends,
        }
    }

    /// Answer every task and record the run in the trace store.
    ///
    /// # Errors
    /// Returns an error when the trace store cannot be written. Task failures are recorded on
    /// their task run and do not fail the run call.
    #[allow(clippy::needless_pass_by_value)]
    pub fn execute_run(
        &self,
        envelope: &RunProfileEnvelope,
        tasks: &[TaskInstance],
        config: RunConfig,
    ) -> Result<RunSummary> {
        self.trace_store.migrate()?;
        let profile = &envelope.profile;
        let run_id = config.run_id.unwrap_or_default();

        self.trace_store.upsert_profile_snapshot(
            &envelope.normalized_hash,
            profile.normalization_version,
            &envelope.source_yaml_hash,
            &envelope.normalized_json,
        )?;
        self.trace_store.insert_run(&RunRecord {
            run_id,
            profile_name: profile.profile_name.clone(),
            profile_version: profile.profile_version.clone(),
            profile_hash: envelope.normalized_hash.clone(),
            started_at: now_utc(),
            ended_at: None,
            status: RunStatus::Running,
            engine_version: config.engine_version.clone(),
            cli_args_json: config.cli_args_json.clone(),
        })?;

        let mut chain = EventChain::default();
        self.emit_event(
            run_id,
            None,
            TraceEventType::ProfileNormalized,
            "system",
            "orchestrator",
            json!({
                "profile_hash": envelope.normalized_hash,
                "source_yaml_hash": envelope.source_yaml_hash,
                "normalization_version": profile.normalization_version,
            }),
            &mut chain,
        )?;
        self.emit_event(
            run_id,
            None,
            TraceEventType::RunStarted,
            "system",
            "orchestrator",
            json!({
                "tasks": tasks.len(),
                "output_dir": config.output_dir.display().to_string(),
                "force_revote": config.force_revote,
            }),
            &mut chain,
        )?;
        info!(run_id = %run_id, tasks = tasks.len(), "run started");

        let mut runner = TaskRunner::new(profile, self.generators, self.backends, &config.output_dir)
            .force_revote(config.force_revote);
        if let Some(num_workers) = config.num_workers {
            runner = runner.num_workers(num_workers);
        }

        let mut tally = TaskTally::default();
        let mut ledger_error: Option<anyhow::Error> = None;
        runner.run_all(tasks, |outcome| {
            tally.count(&outcome);
            if ledger_error.is_some() {
                return;
            }
            if let Err(err) = self.record_task(run_id, &outcome, &mut chain) {
                warn!(run_id = %run_id, error = %err, "failed to record task");
                ledger_error = Some(err);
            }
        });

        if let Some(err) = ledger_error {
            self.trace_store
                .update_run_finished(run_id, RunStatus::Failed)?;
            return Err(err);
        }

        let status = if tally.failed == 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.emit_event(
            run_id,
            None,
            TraceEventType::RunFinished,
            "system",
            "orchestrator",
            json!({
                "status": status.as_str(),
                "tasks": tally.tasks,
                "finalized": tally.finalized,
                "abstained": tally.abstained,
                "no_candidates": tally.no_candidates,
                "skipped": tally.skipped,
                "failed": tally.failed,
            }),
            &mut chain,
        )?;
        self.trace_store.update_run_finished(run_id, status)?;
        info!(run_id = %run_id, status = status.as_str(), "run finished");

        Ok(RunSummary {
            run_id,
            status,
            tally,
        })
    }

    /// Reconstruct and verify the event hash chain for a recorded run.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or trace rows cannot be read.
    pub fn replay_audit(&self, run_id: RunId) -> Result<ReplayReport> {
        if self.trace_store.get_run(run_id)?.is_none() {
            return Err(anyhow!("run {run_id} not found"));
        }
        let events = self.trace_store.list_events_for_run(run_id)?;
        let mut prev: Option<String> = None;
        for row in &events {
            if row.event.prev_event_hash != prev {
                return Ok(ReplayReport {
                    run_id,
                    events: events.len(),
                    chain_valid: false,
                });
            }
            prev = Some(row.event.event_hash.clone());
        }

        Ok(ReplayReport {
            run_id,
            events: events.len(),
            chain_valid: true,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn record_task(&self, run_id: RunId, outcome: &TaskOutcome, chain: &mut EventChain) -> Result<()> {
        let task_run_id = outcome.task_run_id;
        self.trace_store.insert_task_run(&TaskRunRecord {
            task_run_id,
            run_id,
            instance_id: outcome.instance_id.clone(),
            backend: outcome.backend,
            output_dir: outcome.output_dir.display().to_string(),
            started_at: outcome.started_at,
            ended_at: None,
            status: None,
        })?;

        let opening = if outcome.status == TaskStatus::Skipped {
            TraceEventType::TaskSkipped
        } else {
            TraceEventType::TaskStarted
        };
        self.emit_event(
            run_id,
            Some(task_run_id),
            opening,
            "task",
            &outcome.instance_id,
            json!({
                "instance_id": outcome.instance_id,
                "backend": outcome.backend.map(|kind| kind.as_str()),
                "output_dir": outcome.output_dir.display().to_string(),
            }),
            chain,
        )?;

        for call in &outcome.format_calls {
            self.persist_generator_call(run_id, task_run_id, None, call, chain)?;
        }
        for attempt in &outcome.attempts {
            self.trace_store
                .append_attempt(run_id, task_run_id, attempt)?;
            for call in &attempt.generator_calls {
                self.persist_generator_call(run_id, task_run_id, Some(attempt.attempt_index), call, chain)?;
            }
            self.emit_event(
                run_id,
                Some(task_run_id),
                TraceEventType::AttemptFinished,
                "attempt",
                &attempt.attempt_index.to_string(),
                json!({
                    "attempt_index": attempt.attempt_index,
                    "state": attempt.state.as_str(),
                    "abandon_reason": attempt.abandon_reason.as_ref().map(ToString::to_string),
                    "iterations": attempt.iterations,
                    "candidates": attempt.candidates.len(),
                    "reused": attempt.reused,
                }),
                chain,
            )?;
        }

        if !outcome.judge_calls.is_empty() {
            self.emit_event(
                run_id,
                Some(task_run_id),
                TraceEventType::JudgeEscalated,
                "judge",
                &outcome.instance_id,
                json!({ "calls": outcome.judge_calls.len() }),
                chain,
            )?;
            for call in &outcome.judge_calls {
                self.persist_generator_call(run_id, task_run_id, None, call, chain)?;
            }
        }

        if let Some(consensus) = &outcome.consensus {
            self.trace_store
                .append_consensus(run_id, task_run_id, &consensus.decision, &consensus.votes)?;
            self.emit_event(
                run_id,
                Some(task_run_id),
                TraceEventType::ConsensusResolved,
                "resolver",
                &outcome.instance_id,
                json!({
                    "winner": consensus.decision.winner,
                    "vote_count": consensus.decision.vote_count,
                    "support": consensus.decision.support,
                    "tie": consensus.decision.tie,
                    "resolution": consensus.decision.resolution.as_str(),
                    "votes": consensus.votes,
                }),
                chain,
            )?;
            if consensus.decision.resolution != ConsensusResolution::Abstained
                && outcome.status == TaskStatus::Finalized
            {
                self.emit_event(
                    run_id,
                    Some(task_run_id),
                    TraceEventType::ArtifactsFinalized,
                    "resolver",
                    &outcome.instance_id,
                    json!({
                        "winner": consensus.decision.winner,
                        "result_sql": outcome.output_dir.join(artifacts::FINAL_SQL).display().to_string(),
                        "result_csv": outcome.output_dir.join(artifacts::FINAL_CSV).display().to_string(),
                    }),
                    chain,
                )?;
            }
        }

        if let Some(error) = &outcome.error {
            self.emit_event(
                run_id,
                Some(task_run_id),
                TraceEventType::Error,
                "task",
                &outcome.instance_id,
                json!({ "error": error }),
                chain,
            )?;
        }

        self.emit_event(
            run_id,
            Some(task_run_id),
            TraceEventType::TaskFinished,
            "task",
            &outcome.instance_id,
            json!({
                "status": outcome.status.as_str(),
                "backend_calls": outcome.backend_calls,
            }),
            chain,
        )?;
        self.trace_store
            .update_task_finished(task_run_id, outcome.status)?;
        Ok(())
    }

    fn persist_generator_call(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
        attempt_index: Option<usize>,
        call: &GeneratorCallRecord,
        chain: &mut EventChain,
    ) -> Result<()> {
        self.trace_store
            .append_generator_call(run_id, task_run_id, attempt_index, call)?;
        self.emit_event(
            run_id,
            Some(task_run_id),
            TraceEventType::GeneratorCalled,
            "generator",
            &call.generator_name,
            json!({
                "call_id": call.call_id,
                "attempt_index": attempt_index,
                "model_id": call.model_id,
                "request_hash": call.request_hash,
                "response_hash": call.response_hash,
                "latency_ms": call.latency_ms,
                "status": call.status,
            }),
            chain,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_event(
        &self,
        run_id: RunId,
        task_run_id: Option<TaskRunId>,
        event_type: TraceEventType,
        actor_type: &str,
        actor_id: &str,
        payload_json: Value,
        chain: &mut EventChain,
    ) -> Result<EventRow> {
        let occurred_at = now_utc();
        let payload_hash = hash_json(&payload_json)?;
        let event_id = Ulid::new();

        let material = json!({
            "event_id": event_id,
            "run_id": run_id,
            "task_run_id": task_run_id,
            "event_type": event_type,
            "occurred_at": format_rfc3339(occurred_at)?,
            "actor_type": actor_type,
            "actor_id": actor_id,
            "payload_hash": payload_hash,
            "prev_event_hash": chain.prev_event_hash,
        });
        let event_hash = hash_json(&material)?;

        let event = TraceEvent {
            event_id,
            run_id,
            task_run_id,
            event_type,
            occurred_at,
            actor_type: actor_type.to_string(),
            actor_id: actor_id.to_string(),
            payload_json,
            payload_hash,
            prev_event_hash: chain.prev_event_hash.clone(),
            event_hash: event_hash.clone(),
        };

        let event_seq = self.trace_store.append_event(&event)?;
        chain.prev_event_hash = Some(event_hash);

        Ok(EventRow { event_seq, event })
    }
}

#[derive(Debug, Default)]
struct EventChain {
    prev_event_hash: Option<String>,
}

fn format_rfc3339(value: time::OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}
