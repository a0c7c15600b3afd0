use std::fs;
use std::thread;

use anyhow::Result;
use quorum_sql_backend::{BackendTarget, ExecutionLimits};
use quorum_sql_domain::{
    AbandonReason, AttemptRecord, AttemptState, Candidate, CandidateOrigin, Conversation,
    ExecutedCandidate, GeneratorCallRecord, TaskInstance,
};
use quorum_sql_profile::{RefinementSettings, VotingSettings};
use quorum_sql_provider::{GeneratorFactory, SessionRole};
use tracing::{info, warn};

use crate::answer_format::{resolve_answer_format, AnswerFormat};
use crate::artifacts::{remove_if_exists, AttemptPaths, TaskArtifacts};
use crate::refinement::RefinementController;
use crate::BackendProvider;

/// Read-only context shared by every attempt of one task.
#[derive(Debug, Clone)]
pub struct TaskContext<'a> {
    pub task: &'a TaskInstance,
    pub schema: String,
    pub target: BackendTarget,
    pub limits: ExecutionLimits,
    pub refinement: &'a RefinementSettings,
    pub voting: &'a VotingSettings,
    pub artifacts: TaskArtifacts,
}

impl TaskContext<'_> {
    /// Attempts launched for the task: one per vote, or a single one without voting.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        if self.voting.enabled {
            self.voting.num_votes.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolReport {
    /// The task already had a final answer and nothing ran.
    pub skipped: bool,
    pub attempts: Vec<AttemptRecord>,
    pub backend_calls: usize,
    /// Calls made once for the task before any attempt started.
    pub format_calls: Vec<GeneratorCallRecord>,
}

/// Runs the attempts of one task concurrently and waits for all of them.
pub struct VotingPool<'a> {
    generators: &'a dyn GeneratorFactory,
    backends: &'a dyn BackendProvider,
}

impl<'a> VotingPool<'a> {
    #[must_use]
    pub fn new(generators: &'a dyn GeneratorFactory, backends: &'a dyn BackendProvider) -> Self {
        Self {
            generators,
            backends,
        }
    }

    /// # Errors
    /// Returns an error when the task directory cannot be prepared or stale final artifacts
    /// cannot be removed.
    pub fn run(&self, context: &TaskContext<'_>) -> Result<PoolReport> {
        context.artifacts.ensure_dir()?;
        if context.voting.force_revote {
            context.artifacts.clear_final()?;
        } else if context.artifacts.has_final() {
            info!(instance_id = %context.task.instance_id, "final answer exists, skipping task");
            return Ok(PoolReport {
                skipped: true,
                ..PoolReport::default()
            });
        }

        let count = context.attempt_count();
        let format = self.answer_format(context, count);
        let answer_format = format.text.as_deref();
        let results: Vec<(AttemptRecord, usize)> = thread::scope(|scope| {
            let handles: Vec<_> = (0..count)
                .map(|index| scope.spawn(move || self.run_attempt(context, index, answer_format)))
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(
                            instance_id = %context.task.instance_id,
                            attempt = index,
                            "attempt thread panicked"
                        );
                        let mut record = AttemptRecord::new(index);
                        record.abandon(AbandonReason::Panicked);
                        (record, 0)
                    })
                })
                .collect()
        });

        let backend_calls = results.iter().map(|(_, calls)| calls).sum();
        let attempts = results.into_iter().map(|(record, _)| record).collect();
        Ok(PoolReport {
            skipped: false,
            attempts,
            backend_calls,
            format_calls: format.calls,
        })
    }

    /// Resolved once per task. Nothing is asked when every attempt reuses a kept query.
    fn answer_format(&self, context: &TaskContext<'_>, count: usize) -> AnswerFormat {
        let generates = (0..count).any(|index| !context.artifacts.attempt(index).sql.is_file());
        if generates {
            resolve_answer_format(self.generators, context.task, context.refinement)
        } else {
            AnswerFormat {
                text: context.task.format_hint.clone(),
                calls: Vec::new(),
            }
        }
    }

    /// One attempt end to end; returns its record and the number of backend executions it made.
    fn run_attempt(
        &self,
        context: &TaskContext<'_>,
        index: usize,
        answer_format: Option<&str>,
    ) -> (AttemptRecord, usize) {
        let paths = context.artifacts.attempt(index);

        if paths.sql.is_file() {
            return self.reuse_attempt(context, &paths);
        }
        if paths.log.exists() || paths.csv.exists() {
            if let Err(err) = paths.clear() {
                let mut record = AttemptRecord::new(index);
                record.abandon(AbandonReason::Persistence(err.to_string()));
                return (record, 0);
            }
        }

        let generator = match self.generators.open_session(SessionRole::Attempt(index)) {
            Ok(generator) => generator,
            Err(err) => {
                warn!(attempt = index, error = %err, "generator session unavailable");
                let mut record = AttemptRecord::new(index);
                record.abandon(AbandonReason::GeneratorFailure(err.to_string()));
                return (record, 0);
            }
        };
        let mut registry = self.backends.open_registry();
        let mut conversation = Conversation::new();
        let controller = RefinementController {
            task: context.task,
            schema: &context.schema,
            target: &context.target,
            limits: context.limits,
            settings: context.refinement,
            answer_format,
            paths,
        };
        let record = controller.run(generator.as_ref(), &mut conversation, &mut registry);
        let calls = registry.executions();
        registry.close_all();
        (record, calls)
    }

    /// An attempt whose query survives from an earlier run. Its table is rebuilt only under
    /// `force_revote`; without a table it cannot take part in the vote.
    fn reuse_attempt(&self, context: &TaskContext<'_>, paths: &AttemptPaths) -> (AttemptRecord, usize) {
        let mut record = AttemptRecord::new(paths.index);
        record.reused = true;
        let sql = match fs::read_to_string(&paths.sql) {
            Ok(sql) => sql,
            Err(err) => {
                record.abandon(AbandonReason::Persistence(err.to_string()));
                return (record, 0);
            }
        };
        let candidate = Candidate::new(sql.clone(), CandidateOrigin::Generated, paths.index, 0);

        if paths.csv.is_file() {
            record.state = AttemptState::Succeeded;
            record.final_sql = Some(sql);
            record.candidates.push(candidate);
            return (record, 0);
        }
        if !context.voting.force_revote {
            record.candidates.push(candidate);
            return (record, 0);
        }

        let mut registry = self.backends.open_registry();
        let outcome = registry.execute(&context.target, &sql, Some(&paths.csv), &context.limits);
        let calls = registry.executions();
        registry.close_all();
        if outcome.is_success() {
            record.state = AttemptState::Succeeded;
            record.final_sql = Some(sql);
        } else if let Err(err) = remove_if_exists(&paths.csv) {
            warn!(attempt = paths.index, error = %err, "failed to remove partial table");
        }
        info!(
            attempt = paths.index,
            status = outcome.status.as_str(),
            "reused query re-executed"
        );
        record.executions.push(ExecutedCandidate {
            candidate_id: candidate.candidate_id,
            outcome,
        });
        record.candidates.push(candidate);
        (record, calls)
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskContext, VotingPool};
    use crate::artifacts::TaskArtifacts;
    use crate::testing::{fixture_db, sql_reply, sqlite_task, temp_root, InProcessBackends};
    use quorum_sql_backend::{BackendTarget, ExecutionLimits};
    use quorum_sql_domain::{AbandonReason, AttemptState, TaskInstance};
    use quorum_sql_profile::{RefinementSettings, VotingSettings};
    use quorum_sql_provider::{
        Generator, GeneratorFactory, ScriptTranscript, ScriptedGenerator, SessionRole,
    };
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Attempt `i` replays `scripts[i]`; sessions past the end panic.
    struct PerAttempt {
        scripts: Vec<Vec<String>>,
        opened: AtomicUsize,
    }

    impl GeneratorFactory for PerAttempt {
        fn open_session(&self, role: SessionRole) -> anyhow::Result<Box<dyn Generator>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let SessionRole::Attempt(index) = role else {
                return Err(anyhow::anyhow!("no judge in this test"));
            };
            match self.scripts.get(index) {
                Some(script) => Ok(Box::new(ScriptedGenerator::new(script.clone()))),
                None => panic!("unexpected attempt {index}"),
            }
        }
    }

    /// Every attempt replies with the same query; the format session answers with a header.
    struct FormatThenQuery {
        query: String,
        format_sessions: AtomicUsize,
        transcripts: Mutex<Vec<ScriptTranscript>>,
    }

    impl GeneratorFactory for FormatThenQuery {
        fn open_session(&self, role: SessionRole) -> anyhow::Result<Box<dyn Generator>> {
            let reply = match role {
                SessionRole::AnswerFormat => {
                    self.format_sessions.fetch_add(1, Ordering::SeqCst);
                    "```csv\nregion,total\nnorth:str,1.0:float\n```".to_string()
                }
                SessionRole::Attempt(_) => sql_reply(&self.query),
                SessionRole::Judge => return Err(anyhow::anyhow!("no judge in this test")),
            };
            let generator = ScriptedGenerator::new([reply]);
            if let Ok(mut transcripts) = self.transcripts.lock() {
                transcripts.push(generator.transcript());
            }
            Ok(Box::new(generator))
        }
    }

    fn context<'a>(
        task: &'a TaskInstance,
        root: &std::path::Path,
        refinement: &'a RefinementSettings,
        voting: &'a VotingSettings,
    ) -> TaskContext<'a> {
        TaskContext {
            task,
            schema: String::new(),
            target: BackendTarget::for_task(task, None).unwrap_or_else(|_| unreachable!()),
            limits: ExecutionLimits::default(),
            refinement,
            voting,
            artifacts: TaskArtifacts::new(&root.join("out"), &task.instance_id),
        }
    }

    fn direct() -> RefinementSettings {
        RefinementSettings {
            self_consistency: false,
            ..RefinementSettings::default()
        }
    }

    #[test]
    fn every_attempt_runs_with_its_own_files() {
        let root = temp_root("pool");
        let task = sqlite_task("local010", &fixture_db(&root));
        let refinement = direct();
        let voting = VotingSettings::default();
        let factory = PerAttempt {
            scripts: vec![
                vec![sql_reply("SELECT id FROM orders")],
                vec![sql_reply("SELECT id FROM orders ORDER BY id DESC")],
                vec![sql_reply("SELECT region FROM orders")],
            ],
            opened: AtomicUsize::new(0),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);

        let report = VotingPool::new(&factory, &backends).run(&context);
        assert!(report.is_ok());
        let report = report.unwrap_or_else(|_| unreachable!());

        assert!(!report.skipped);
        assert_eq!(report.attempts.len(), 3);
        assert!(report.attempts.iter().all(|attempt| attempt.succeeded()));
        assert_eq!(report.backend_calls, 3);
        for index in 0..3 {
            assert!(context.artifacts.attempt(index).sql.is_file());
            assert!(context.artifacts.attempt(index).csv.is_file());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn panicked_attempt_does_not_poison_pool() {
        let root = temp_root("pool-panic");
        let task = sqlite_task("local011", &fixture_db(&root));
        let refinement = direct();
        let voting = VotingSettings::default();
        let factory = PerAttempt {
            scripts: vec![
                vec![sql_reply("SELECT id FROM orders")],
                vec![sql_reply("SELECT id FROM orders")],
            ],
            opened: AtomicUsize::new(0),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);

        let report = VotingPool::new(&factory, &backends)
            .run(&context)
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempts[2].state, AttemptState::Abandoned);
        assert_eq!(report.attempts[2].abandon_reason, Some(AbandonReason::Panicked));
        assert!(report.attempts[0].succeeded());
        assert!(report.attempts[1].succeeded());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_final_answer_skips_without_calls() {
        let root = temp_root("pool-skip");
        let task = sqlite_task("local012", &fixture_db(&root));
        let refinement = direct();
        let voting = VotingSettings::default();
        let factory = PerAttempt {
            scripts: Vec::new(),
            opened: AtomicUsize::new(0),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);
        assert!(context.artifacts.ensure_dir().is_ok());
        assert!(fs::write(context.artifacts.final_sql(), "SELECT 1").is_ok());

        let report = VotingPool::new(&factory, &backends)
            .run(&context)
            .unwrap_or_else(|_| unreachable!());

        assert!(report.skipped);
        assert!(report.attempts.is_empty());
        assert_eq!(report.backend_calls, 0);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn revote_rebuilds_missing_tables_from_kept_queries() {
        let root = temp_root("pool-revote");
        let task = sqlite_task("local013", &fixture_db(&root));
        let refinement = direct();
        let voting = VotingSettings {
            force_revote: true,
            num_votes: 2,
            ..VotingSettings::default()
        };
        let factory = PerAttempt {
            scripts: Vec::new(),
            opened: AtomicUsize::new(0),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);
        assert!(context.artifacts.ensure_dir().is_ok());
        assert!(fs::write(context.artifacts.final_sql(), "SELECT 1").is_ok());
        assert!(fs::write(context.artifacts.vote_log(), "old").is_ok());
        for index in 0..2 {
            let paths = context.artifacts.attempt(index);
            assert!(fs::write(&paths.sql, "SELECT id FROM orders").is_ok());
        }
        assert!(fs::write(&context.artifacts.attempt(0).csv, "id\n1\n").is_ok());

        let report = VotingPool::new(&factory, &backends)
            .run(&context)
            .unwrap_or_else(|_| unreachable!());

        assert!(!context.artifacts.has_final());
        assert!(!context.artifacts.vote_log().exists());
        assert!(report.attempts.iter().all(|attempt| attempt.reused && attempt.succeeded()));
        assert_eq!(report.backend_calls, 1);
        assert!(context.artifacts.attempt(1).csv.is_file());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stale_log_without_query_is_rerun() {
        let root = temp_root("pool-stale");
        let task = sqlite_task("local014", &fixture_db(&root));
        let refinement = direct();
        let voting = VotingSettings {
            enabled: false,
            ..VotingSettings::default()
        };
        let factory = PerAttempt {
            scripts: vec![vec![sql_reply("SELECT id FROM orders")]],
            opened: AtomicUsize::new(0),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);
        assert!(context.artifacts.ensure_dir().is_ok());
        let paths = context.artifacts.attempt(0);
        assert!(fs::write(&paths.log, "[Error]\nold\n[Error]\n").is_ok());

        let report = VotingPool::new(&factory, &backends)
            .run(&context)
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].succeeded());
        let log = fs::read_to_string(&paths.log).unwrap_or_default();
        assert!(!log.contains("old"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn answer_format_is_asked_once_and_shared_by_every_attempt() {
        let root = temp_root("pool-format");
        let task = sqlite_task("local015", &fixture_db(&root));
        let refinement = RefinementSettings {
            format_restriction: true,
            ..direct()
        };
        let voting = VotingSettings::default();
        let factory = FormatThenQuery {
            query: "SELECT region, SUM(amount) AS total FROM orders GROUP BY region".to_string(),
            format_sessions: AtomicUsize::new(0),
            transcripts: Mutex::new(Vec::new()),
        };
        let backends = InProcessBackends::new(std::slice::from_ref(&task));
        let context = context(&task, &root, &refinement, &voting);

        let report = VotingPool::new(&factory, &backends)
            .run(&context)
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(factory.format_sessions.load(Ordering::SeqCst), 1);
        assert_eq!(report.format_calls.len(), 1);
        assert_eq!(report.attempts.len(), 3);
        let transcripts = factory.transcripts.lock().unwrap_or_else(|_| unreachable!());
        assert_eq!(transcripts.len(), 4);
        assert!(transcripts[0].prompts()[0].starts_with("Task: "));
        for transcript in &transcripts[1..] {
            assert!(transcript.prompts()[0]
                .contains("Follow this answer format: ```csv\nregion,total\n```."));
        }
        let _ = fs::remove_dir_all(root);
    }
}
