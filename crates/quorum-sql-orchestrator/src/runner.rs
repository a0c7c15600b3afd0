use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use quorum_sql_backend::{read_csv_table, BackendTarget, ExecutionLimits};
use quorum_sql_consensus::{
    resolve, ConsensusCandidate, ConsensusOutcome, ConsensusPolicy, Judge,
};
use quorum_sql_domain::{
    now_utc, AttemptRecord, BackendKind, ConsensusResolution, DateTimeUtc, GeneratorCallRecord,
    TaskInstance, TaskRunId, TaskStatus,
};
use quorum_sql_profile::{LimitSettings, RunProfile, VotingSettings};
use quorum_sql_provider::{GeneratorFactory, SessionRole};
use tracing::{info, warn};

use crate::artifacts::TaskArtifacts;
use crate::judge::GeneratorJudge;
use crate::pool::{TaskContext, VotingPool};
use crate::BackendProvider;

/// Everything one task produced, handed back to the run for the ledger.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_run_id: TaskRunId,
    pub instance_id: String,
    pub backend: Option<BackendKind>,
    pub output_dir: PathBuf,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
    pub status: TaskStatus,
    pub attempts: Vec<AttemptRecord>,
    pub consensus: Option<ConsensusOutcome>,
    pub format_calls: Vec<GeneratorCallRecord>,
    pub judge_calls: Vec<GeneratorCallRecord>,
    pub backend_calls: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Resolution {
    status: Option<TaskStatus>,
    backend: Option<BackendKind>,
    attempts: Vec<AttemptRecord>,
    consensus: Option<ConsensusOutcome>,
    format_calls: Vec<GeneratorCallRecord>,
    judge_calls: Vec<GeneratorCallRecord>,
    backend_calls: usize,
}

#[must_use]
pub fn execution_limits(limits: &LimitSettings) -> ExecutionLimits {
    ExecutionLimits {
        size_limit: limits.size_limit_bytes,
        time_limit: Duration::from_millis(limits.time_limit_ms),
        grace_period: Duration::from_millis(limits.grace_period_ms),
    }
}

/// Inline schema text wins over a schema file; a task may carry neither.
///
/// # Errors
/// Returns an error when `schema_path` is set but unreadable.
pub fn load_schema(task: &TaskInstance) -> Result<String> {
    if let Some(text) = task.schema_text.as_deref() {
        return Ok(text.to_string());
    }
    match task.schema_path.as_deref() {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read schema {}", path.display())),
        None => Ok(String::new()),
    }
}

/// Processes task instances on a fixed number of worker threads.
pub struct TaskRunner<'a> {
    profile: &'a RunProfile,
    generators: &'a dyn GeneratorFactory,
    backends: &'a dyn BackendProvider,
    output_dir: &'a Path,
    force_revote: bool,
    num_workers: usize,
}

impl<'a> TaskRunner<'a> {
    #[must_use]
    pub fn new(
        profile: &'a RunProfile,
        generators: &'a dyn GeneratorFactory,
        backends: &'a dyn BackendProvider,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            profile,
            generators,
            backends,
            output_dir,
            force_revote: profile.voting.force_revote,
            num_workers: profile.pool.num_workers,
        }
    }

    #[must_use]
    pub fn force_revote(mut self, force_revote: bool) -> Self {
        self.force_revote = self.force_revote || force_revote;
        self
    }

    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Run every task and hand each outcome to `on_finished` on the calling thread, in completion
    /// order.
    pub fn run_all<F>(&self, tasks: &[TaskInstance], mut on_finished: F)
    where
        F: FnMut(TaskOutcome),
    {
        let worker_count = self.num_workers.clamp(1, tasks.len().max(1));
        let (task_tx, task_rx) = mpsc::channel::<&TaskInstance>();
        let (done_tx, done_rx) = mpsc::channel::<TaskOutcome>();
        for task in tasks {
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);
        let shared_rx = Mutex::new(task_rx);

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let worker_rx = &shared_rx;
                let worker_done = done_tx.clone();
                scope.spawn(move || loop {
                    let task = {
                        let Ok(guard) = worker_rx.lock() else {
                            break;
                        };
                        match guard.recv() {
                            Ok(task) => task,
                            Err(_) => break,
                        }
                    };
                    if worker_done.send(self.run_task(task)).is_err() {
                        break;
                    }
                });
            }
            drop(done_tx);
            for outcome in done_rx {
                on_finished(outcome);
            }
        });
    }

    /// Attempts, consensus and finalization for one task. Failures end up in the outcome.
    #[must_use]
    pub fn run_task(&self, task: &TaskInstance) -> TaskOutcome {
        let started_at = now_utc();
        let artifacts = TaskArtifacts::new(self.output_dir, &task.instance_id);
        info!(instance_id = %task.instance_id, "task started");

        let mut resolution = Resolution::default();
        let error = match self.resolve_task(task, &artifacts, &mut resolution) {
            Ok(()) => None,
            Err(err) => {
                warn!(instance_id = %task.instance_id, error = %err, "task failed");
                Some(format!("{err:#}"))
            }
        };
        let status = match (&error, resolution.status) {
            (None, Some(status)) => status,
            _ => TaskStatus::Failed,
        };
        info!(instance_id = %task.instance_id, status = status.as_str(), "task finished");

        TaskOutcome {
            task_run_id: TaskRunId::new(),
            instance_id: task.instance_id.clone(),
            backend: resolution.backend,
            output_dir: artifacts.dir,
            started_at,
            ended_at: now_utc(),
            status,
            attempts: resolution.attempts,
            consensus: resolution.consensus,
            format_calls: resolution.format_calls,
            judge_calls: resolution.judge_calls,
            backend_calls: resolution.backend_calls,
            error,
        }
    }

    fn resolve_task(
        &self,
        task: &TaskInstance,
        artifacts: &TaskArtifacts,
        resolution: &mut Resolution,
    ) -> Result<()> {
        let target = BackendTarget::for_task(task, self.profile.backend.kind)?;
        resolution.backend = Some(target.kind);
        let schema = load_schema(task)?;
        let voting = VotingSettings {
            force_revote: self.force_revote,
            ..self.profile.voting.clone()
        };
        let context = TaskContext {
            task,
            schema,
            target,
            limits: execution_limits(&self.profile.limits),
            refinement: &self.profile.refinement,
            voting: &voting,
            artifacts: artifacts.clone(),
        };

        let report = VotingPool::new(self.generators, self.backends).run(&context)?;
        resolution.backend_calls = report.backend_calls;
        resolution.format_calls = report.format_calls;
        if report.skipped {
            resolution.status = Some(TaskStatus::Skipped);
            return Ok(());
        }
        resolution.attempts = report.attempts;

        let candidates = consensus_candidates(&resolution.attempts, artifacts);
        let policy = if voting.enabled {
            ConsensusPolicy {
                judge_on_tie: voting.judge_on_tie,
                pick_first_on_tie: voting.pick_first_on_tie,
            }
        } else {
            ConsensusPolicy {
                judge_on_tie: false,
                pick_first_on_tie: true,
            }
        };
        let judge = if policy.judge_on_tie {
            self.open_judge(&context)
        } else {
            None
        };
        let outcome = resolve(&candidates, policy, judge.as_ref().map(|judge| judge as &dyn Judge));
        if let Some(judge) = judge {
            resolution.judge_calls = judge.into_calls();
        }

        let winner = outcome.winner(&candidates).map(|winner| winner.attempt_index);
        let decided = outcome.decision.resolution;
        let support = outcome.decision.support;
        resolution.consensus = Some(outcome);

        resolution.status = Some(match winner {
            Some(attempt_index) => {
                artifacts.finalize(&artifacts.attempt(attempt_index))?;
                info!(
                    instance_id = %task.instance_id,
                    attempt = attempt_index,
                    resolution = decided.as_str(),
                    support,
                    "final answer written"
                );
                TaskStatus::Finalized
            }
            None if decided == ConsensusResolution::NoCandidates => TaskStatus::NoCandidates,
            None => TaskStatus::Abstained,
        });
        Ok(())
    }

    fn open_judge<'c>(&self, context: &'c TaskContext<'_>) -> Option<GeneratorJudge<'c>> {
        if self.profile.judge.is_none() {
            return None;
        }
        match self.generators.open_session(SessionRole::Judge) {
            Ok(generator) => Some(GeneratorJudge::new(
                generator,
                context.task,
                &context.schema,
                context.artifacts.vote_log(),
            )),
            Err(err) => {
                warn!(instance_id = %context.task.instance_id, error = %err, "judge unavailable");
                None
            }
        }
    }
}

/// Succeeded attempts whose table can be read back, in attempt order.
fn consensus_candidates(
    attempts: &[AttemptRecord],
    artifacts: &TaskArtifacts,
) -> Vec<ConsensusCandidate> {
    let mut candidates = Vec::new();
    for attempt in attempts.iter().filter(|attempt| attempt.succeeded()) {
        let paths = artifacts.attempt(attempt.attempt_index);
        let sql = match attempt.final_sql.clone() {
            Some(sql) => sql,
            None => match fs::read_to_string(&paths.sql) {
                Ok(sql) => sql,
                Err(err) => {
                    warn!(attempt = attempt.attempt_index, error = %err, "query unreadable");
                    continue;
                }
            },
        };
        match read_csv_table(&paths.csv) {
            Ok(table) => candidates.push(ConsensusCandidate {
                attempt_index: attempt.attempt_index,
                sql,
                table,
                sql_artifact: paths.sql,
                csv_artifact: paths.csv,
            }),
            Err(err) => {
                warn!(attempt = attempt.attempt_index, error = %err, "result table unreadable");
            }
        }
    }
    candidates
}
