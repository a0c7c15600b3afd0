use std::collections::BTreeSet;
use std::fs;

use quorum_sql_backend::{read_csv_table, BackendRegistry, BackendTarget, ExecutionLimits};
use quorum_sql_consensus::{consistency_fingerprint, degenerate_columns, nested_values};
use quorum_sql_domain::{
    hard_cut, AbandonReason, AttemptRecord, AttemptState, Candidate, CandidateOrigin,
    Conversation, ExecutedCandidate, ExecutionOutcome, ExecutionStatus, GeneratorCallRecord,
    TaskInstance,
};
use quorum_sql_profile::RefinementSettings;
use quorum_sql_provider::Generator;
use tracing::{debug, info, warn};

use crate::artifacts::{remove_if_exists, AttemptPaths};
use crate::attempt_log::AttemptLog;
use crate::correction::{
    correct, request_single_block, select_longest, CorrectionOutcome, Session,
};
use crate::exploration::ColumnExplorer;
use crate::prompts::{
    degenerate_hint, flatten_hint, generation_prompt, self_consistency_prompt, CAST_HINT,
};

const LOGGED_RESULT_CHARS: usize = 500;

/// How the next candidate of an attempt is obtained.
enum Step {
    Generate(String),
    Correct {
        query: String,
        error: String,
        simplify: bool,
    },
}

enum Verdict {
    Continue(Step),
    Finish,
}

/// Drives one attempt from the first generation request to a terminal state.
pub struct RefinementController<'a> {
    pub task: &'a TaskInstance,
    pub schema: &'a str,
    pub target: &'a BackendTarget,
    pub limits: ExecutionLimits,
    pub settings: &'a RefinementSettings,
    /// Shared by every attempt of the task.
    pub answer_format: Option<&'a str>,
    pub paths: AttemptPaths,
}

/// Mutable bookkeeping of a running attempt.
struct Progress {
    record: AttemptRecord,
    fingerprints: Vec<String>,
    recent: Vec<ExecutionStatus>,
    timed_out: BTreeSet<String>,
    failure_streak: usize,
    successes: usize,
}

impl RefinementController<'_> {
    /// Run the attempt. Every failure ends up in the returned record; nothing is raised.
    pub fn run(
        &self,
        generator: &dyn Generator,
        conversation: &mut Conversation,
        registry: &mut BackendRegistry,
    ) -> AttemptRecord {
        conversation.reset();
        let mut log = AttemptLog::open(&self.paths.log);
        let (exploration, exploration_calls) = self.explore(generator, registry, &mut log);
        let opening = generation_prompt(
            self.task,
            self.schema,
            self.target.kind,
            self.answer_format,
            exploration.as_deref(),
        );
        let mut session = Session::new(generator, conversation);
        let mut progress = Progress {
            record: AttemptRecord::new(self.paths.index),
            fingerprints: Vec::new(),
            recent: Vec::new(),
            timed_out: BTreeSet::new(),
            failure_streak: 0,
            successes: 0,
        };

        if self.settings.enabled {
            self.refine(opening, &mut session, &mut log, registry, &mut progress);
        } else {
            self.single_shot(opening, &mut session, &mut log, registry, &mut progress);
        }

        let mut record = progress.record;
        record.generator_calls = exploration_calls;
        record.generator_calls.extend(session.into_calls());
        if record.state != AttemptState::Succeeded {
            self.drop_partial_table();
        }
        info!(
            attempt = record.attempt_index,
            state = record.state.as_str(),
            iterations = record.iterations,
            "attempt finished"
        );
        record
    }

    /// Column exploration in a conversation of its own, so the attempt's conversation starts
    /// from the generation request.
    fn explore(
        &self,
        generator: &dyn Generator,
        registry: &mut BackendRegistry,
        log: &mut AttemptLog,
    ) -> (Option<String>, Vec<GeneratorCallRecord>) {
        if !self.settings.column_exploration {
            return (None, Vec::new());
        }
        let mut scratch = Conversation::new();
        let mut session = Session::new(generator, &mut scratch);
        let explorer = ColumnExplorer {
            task: self.task,
            schema: self.schema,
            target: self.target,
            limits: self.limits,
            max_queries: self.settings.exploration_max_queries,
            max_try: self.settings.max_try,
        };
        let notes = explorer.explore(&mut session, registry, log);
        (notes, session.into_calls())
    }

    fn refine(
        &self,
        opening: String,
        session: &mut Session<'_>,
        log: &mut AttemptLog,
        registry: &mut BackendRegistry,
        progress: &mut Progress,
    ) {
        let mut step = Step::Generate(opening);

        while progress.record.iterations < self.settings.max_iter {
            let iteration = progress.record.iterations;
            progress.record.iterations += 1;
            log.line(&format!("iteration: {iteration}"));

            let Some(candidate) = self.next_candidate(step, iteration, session, log, progress)
            else {
                return;
            };
            let outcome = self.execute(&candidate, registry, progress);
            let verdict = self.assess(&candidate, &outcome, iteration, log, progress);
            progress.record.executions.push(ExecutedCandidate {
                candidate_id: candidate.candidate_id,
                outcome,
            });
            progress.record.candidates.push(candidate);
            match verdict {
                Verdict::Continue(next) => step = next,
                Verdict::Finish => return,
            }
        }

        log.line(&format!("Total iteration counts: {}", progress.record.iterations));
        progress.record.state = AttemptState::Exhausted;
    }

    fn single_shot(
        &self,
        opening: String,
        session: &mut Session<'_>,
        log: &mut AttemptLog,
        registry: &mut BackendRegistry,
        progress: &mut Progress,
    ) {
        progress.record.iterations = 1;
        let Some(candidate) =
            self.next_candidate(Step::Generate(opening), 0, session, log, progress)
        else {
            return;
        };
        let outcome = self.execute(&candidate, registry, progress);
        if outcome.is_success() {
            self.accept(&candidate.text, progress);
        } else {
            log.section("Error", &outcome.signal());
        }
        progress.record.executions.push(ExecutedCandidate {
            candidate_id: candidate.candidate_id,
            outcome,
        });
        progress.record.candidates.push(candidate);
    }

    /// Obtain one query, or abandon the attempt and return `None`.
    fn next_candidate(
        &self,
        step: Step,
        iteration: usize,
        session: &mut Session<'_>,
        log: &mut AttemptLog,
        progress: &mut Progress,
    ) -> Option<Candidate> {
        let attempt = self.paths.index;
        match step {
            Step::Generate(prompt) => {
                log.section("Self-refine", &prompt);
                match request_single_block(session, &prompt, self.settings.max_try) {
                    Ok(Some(query)) => {
                        log.section(
                            "Try to run SQL in self-refine",
                            session.last_reply().unwrap_or_default(),
                        );
                        Some(Candidate::new(
                            query,
                            CandidateOrigin::Generated,
                            attempt,
                            iteration,
                        ))
                    }
                    Ok(None) => {
                        warn!(attempt, iteration, "generator did not return a single query");
                        progress.record.abandon(AbandonReason::MalformedResponse);
                        None
                    }
                    Err(err) => {
                        warn!(attempt, iteration, error = %err, "generation request failed");
                        progress
                            .record
                            .abandon(AbandonReason::GeneratorFailure(err.to_string()));
                        None
                    }
                }
            }
            Step::Correct {
                query,
                error,
                simplify,
            } => match correct(session, &query, &error, simplify, self.settings.max_try) {
                CorrectionOutcome::Candidates(candidates) => {
                    let corrected = select_longest(&candidates).unwrap_or_default().to_string();
                    log.section("Corrected SQL", &corrected);
                    Some(Candidate::new(
                        corrected,
                        CandidateOrigin::Corrected,
                        attempt,
                        iteration,
                    ))
                }
                CorrectionOutcome::Invalid => {
                    let reason = match session.last_failure() {
                        Some(failure) => {
                            log.section("Error", failure);
                            AbandonReason::GeneratorFailure(failure.to_string())
                        }
                        None => AbandonReason::MalformedResponse,
                    };
                    warn!(attempt, iteration, reason = %reason, "correction failed");
                    progress.record.abandon(reason);
                    None
                }
            },
        }
    }

    fn execute(
        &self,
        candidate: &Candidate,
        registry: &mut BackendRegistry,
        progress: &mut Progress,
    ) -> ExecutionOutcome {
        if progress.timed_out.contains(&candidate.text) {
            debug!(attempt = self.paths.index, "skipping query that already timed out");
            return ExecutionOutcome::timeout(&candidate.text);
        }
        let outcome = registry.execute(
            self.target,
            &candidate.text,
            Some(&self.paths.csv),
            &self.limits,
        );
        if outcome.status == ExecutionStatus::Timeout {
            progress.timed_out.insert(candidate.text.clone());
        }
        debug!(
            attempt = self.paths.index,
            iteration = candidate.iteration_index,
            status = outcome.status.as_str(),
            "candidate executed"
        );
        outcome
    }

    /// Decide what an execution outcome means for the attempt.
    fn assess(
        &self,
        candidate: &Candidate,
        outcome: &ExecutionOutcome,
        iteration: usize,
        log: &mut AttemptLog,
        progress: &mut Progress,
    ) -> Verdict {
        progress.recent.push(outcome.status);

        if outcome.is_success() {
            progress.failure_streak = 0;
            progress.successes += 1;
            return self.check_consistency(candidate, iteration, log, progress);
        }

        progress.failure_streak += 1;
        let signal = outcome.signal();
        log.section("Error", &signal);

        let window = self.settings.early_stop_window;
        if self.settings.early_stop
            && window > 0
            && progress.recent.len() >= window
            && progress.recent[progress.recent.len() - window..]
                .iter()
                .all(|status| *status == ExecutionStatus::Empty)
        {
            log.line("No data found for the specified query, remove file.");
            return self.abandon(AbandonReason::EarlyStop, progress);
        }

        if progress.successes == 0 && progress.failure_streak >= self.settings.failure_streak_limit
        {
            return self.abandon(AbandonReason::FailureStreak, progress);
        }

        Verdict::Continue(Step::Correct {
            query: candidate.text.clone(),
            error: signal,
            simplify: outcome.status == ExecutionStatus::Empty,
        })
    }

    fn check_consistency(
        &self,
        candidate: &Candidate,
        iteration: usize,
        log: &mut AttemptLog,
        progress: &mut Progress,
    ) -> Verdict {
        if !self.settings.self_consistency {
            self.accept(&candidate.text, progress);
            return Verdict::Finish;
        }

        let csv_text = match fs::read_to_string(&self.paths.csv) {
            Ok(text) => text,
            Err(err) => {
                return self.abandon(AbandonReason::Persistence(err.to_string()), progress)
            }
        };
        let table = match read_csv_table(&self.paths.csv) {
            Ok(table) => table,
            Err(err) => {
                return self.abandon(AbandonReason::Persistence(err.to_string()), progress)
            }
        };
        log.section("Results", &hard_cut(&csv_text, LOGGED_RESULT_CHARS).0);

        if self.settings.keep_all_iterations {
            self.keep_iteration(&candidate.text, iteration);
        }

        let mut prompt =
            self_consistency_prompt(self.task, self.answer_format, &csv_text, &candidate.text);
        if csv_text.contains("\"\"\"") {
            prompt.push_str(CAST_HINT);
        }

        let nested = nested_values(&table);
        let degenerate = degenerate_columns(&table);
        if !nested.is_empty() {
            prompt.push_str(&flatten_hint(&nested));
        } else if !degenerate.is_empty() {
            prompt.push_str(&degenerate_hint(&degenerate));
        } else {
            let fingerprint = consistency_fingerprint(&table, self.settings.ignore_row_order);
            if progress.fingerprints.contains(&fingerprint) {
                log.section("Consistent results", &hard_cut(&csv_text, LOGGED_RESULT_CHARS).0);
                self.accept(&candidate.text, progress);
                return Verdict::Finish;
            }
            progress.fingerprints.push(fingerprint);
        }

        Verdict::Continue(Step::Generate(prompt))
    }

    fn accept(&self, query: &str, progress: &mut Progress) {
        match fs::write(&self.paths.sql, query) {
            Ok(()) => {
                progress.record.state = AttemptState::Succeeded;
                progress.record.final_sql = Some(query.to_string());
            }
            Err(err) => {
                warn!(attempt = self.paths.index, error = %err, "failed to persist query");
                progress
                    .record
                    .abandon(AbandonReason::Persistence(err.to_string()));
            }
        }
    }

    fn abandon(&self, reason: AbandonReason, progress: &mut Progress) -> Verdict {
        warn!(attempt = self.paths.index, reason = %reason, "attempt abandoned");
        progress.record.abandon(reason);
        Verdict::Finish
    }

    fn keep_iteration(&self, query: &str, iteration: usize) {
        let sql_copy = self.paths.iteration_sql(iteration);
        let csv_copy = self.paths.iteration_csv(iteration);
        if let Err(err) = fs::write(&sql_copy, query) {
            warn!(path = %sql_copy.display(), error = %err, "failed to keep iteration query");
        }
        if let Err(err) = fs::copy(&self.paths.csv, &csv_copy) {
            warn!(path = %csv_copy.display(), error = %err, "failed to keep iteration table");
        }
    }

    fn drop_partial_table(&self) {
        if self.settings.keep_all_iterations {
            return;
        }
        if let Err(err) = remove_if_exists(&self.paths.csv) {
            warn!(attempt = self.paths.index, error = %err, "failed to remove partial table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RefinementController;
    use crate::artifacts::TaskArtifacts;
    use crate::testing::{fixture_db, registry_for, sqlite_task, sql_reply, temp_root};
    use quorum_sql_backend::{BackendTarget, ExecutionLimits};
    use quorum_sql_domain::{AbandonReason, AttemptState, Conversation};
    use quorum_sql_profile::RefinementSettings;
    use quorum_sql_provider::ScriptedGenerator;
    use std::fs;

    struct Fixture {
        root: std::path::PathBuf,
        task: quorum_sql_domain::TaskInstance,
        target: BackendTarget,
        artifacts: TaskArtifacts,
    }

    fn fixture() -> Fixture {
        let root = temp_root("refine");
        let db = fixture_db(&root);
        let task = sqlite_task("local001", &db);
        let target = BackendTarget::for_task(&task, None).unwrap_or_else(|_| unreachable!());
        let artifacts = TaskArtifacts::new(&root.join("out"), &task.instance_id);
        assert!(artifacts.ensure_dir().is_ok());
        Fixture {
            root,
            task,
            target,
            artifacts,
        }
    }

    fn controller<'a>(
        fixture: &'a Fixture,
        settings: &'a RefinementSettings,
    ) -> RefinementController<'a> {
        RefinementController {
            task: &fixture.task,
            schema: "CREATE TABLE orders(id INTEGER, amount REAL, region TEXT)",
            target: &fixture.target,
            limits: ExecutionLimits::default(),
            settings,
            answer_format: None,
            paths: fixture.artifacts.attempt(0),
        }
    }

    #[test]
    fn consistent_answer_succeeds_and_persists_query() {
        let fixture = fixture();
        let settings = RefinementSettings::default();
        let query = "SELECT region, SUM(amount) FROM orders GROUP BY region";
        let generator = ScriptedGenerator::new([sql_reply(query), sql_reply(query)]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Succeeded);
        assert_eq!(record.iterations, 2);
        assert_eq!(transcript.calls(), 2);
        assert!(transcript.prompts()[1].contains("Current SQL:\n"));
        let paths = fixture.artifacts.attempt(0);
        assert_eq!(fs::read_to_string(&paths.sql).unwrap_or_default(), query);
        assert!(paths.csv.is_file());
        let log = fs::read_to_string(&paths.log).unwrap_or_default();
        assert!(log.contains("[Consistent results]"));
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn error_is_corrected_with_exact_backend_message() {
        let fixture = fixture();
        let settings = RefinementSettings {
            self_consistency: false,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([
            sql_reply("SELECT missing FROM orders"),
            sql_reply("SELECT id FROM orders"),
        ]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Succeeded);
        let prompts = transcript.prompts();
        assert!(prompts[1].starts_with("Input SQL:\nSELECT missing FROM orders\nError info:\n"));
        assert!(prompts[1].contains("no such column: missing"));
        assert_eq!(record.candidates.len(), 2);
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn repeated_empty_results_stop_early_and_drop_table() {
        let fixture = fixture();
        let settings = RefinementSettings {
            max_iter: 10,
            failure_streak_limit: 10,
            ..RefinementSettings::default()
        };
        let empty = "SELECT id FROM orders WHERE region = 'nowhere'";
        let generator = ScriptedGenerator::new(vec![sql_reply(empty); 6]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Abandoned);
        assert_eq!(record.abandon_reason, Some(AbandonReason::EarlyStop));
        assert_eq!(record.iterations, 4);
        assert_eq!(transcript.calls(), 4);
        assert!(transcript.prompts()[1].contains("simplify some conditions"));
        assert!(!fixture.artifacts.attempt(0).csv.exists());
        assert!(!fixture.artifacts.attempt(0).sql.exists());
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn failure_streak_abandons_attempt() {
        let fixture = fixture();
        let settings = RefinementSettings {
            max_iter: 10,
            failure_streak_limit: 3,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new(vec![sql_reply("SELECT nope FROM orders"); 5]);
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.abandon_reason, Some(AbandonReason::FailureStreak));
        assert_eq!(record.executions.len(), 3);
        assert_eq!(registry.executions(), 3);
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn exhausted_budget_removes_partial_table() {
        let fixture = fixture();
        let settings = RefinementSettings {
            max_iter: 2,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([
            sql_reply("SELECT id FROM orders ORDER BY id"),
            sql_reply("SELECT amount FROM orders ORDER BY id"),
        ]);
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Exhausted);
        assert_eq!(record.iterations, 2);
        assert!(!fixture.artifacts.attempt(0).csv.exists());
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn keep_all_iterations_keeps_each_table() {
        let fixture = fixture();
        let settings = RefinementSettings {
            max_iter: 2,
            keep_all_iterations: true,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([
            sql_reply("SELECT id FROM orders ORDER BY id"),
            sql_reply("SELECT amount FROM orders ORDER BY id"),
        ]);
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        let paths = fixture.artifacts.attempt(0);
        assert_eq!(record.state, AttemptState::Exhausted);
        assert!(paths.iteration_sql(0).is_file());
        assert!(paths.iteration_csv(1).is_file());
        assert!(paths.csv.is_file());
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn degenerate_table_is_never_accepted() {
        let fixture = fixture();
        let settings = RefinementSettings {
            max_iter: 3,
            ..RefinementSettings::default()
        };
        let zero = "SELECT 0 AS total FROM orders";
        let generator = ScriptedGenerator::new(vec![sql_reply(zero); 3]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Exhausted);
        assert!(transcript.prompts()[1].contains("Empty results in Column [\"total\"]"));
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn malformed_reply_abandons() {
        let fixture = fixture();
        let settings = RefinementSettings::default();
        let generator = ScriptedGenerator::new(["no query", "still no query", "nothing"]);
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.abandon_reason, Some(AbandonReason::MalformedResponse));
        assert_eq!(registry.executions(), 0);
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn generator_failure_abandons() {
        let fixture = fixture();
        let settings = RefinementSettings::default();
        let generator = ScriptedGenerator::new(Vec::<String>::new());
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert!(matches!(
            record.abandon_reason,
            Some(AbandonReason::GeneratorFailure(_))
        ));
        assert_eq!(record.generator_calls.len(), 1);
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn single_shot_runs_one_generation() {
        let fixture = fixture();
        let settings = RefinementSettings {
            enabled: false,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([sql_reply("SELECT COUNT(*) FROM orders")]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Succeeded);
        assert_eq!(transcript.calls(), 1);
        assert!(fixture.artifacts.attempt(0).sql.is_file());
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn explored_column_values_reach_the_first_generation_prompt() {
        let fixture = fixture();
        let settings = RefinementSettings {
            self_consistency: false,
            column_exploration: true,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([
            sql_reply(
                "SELECT DISTINCT region FROM orders;\nSELECT COUNT(*) AS n FROM orders;\nSELECT MAX(amount) AS top FROM orders;",
            ),
            sql_reply("SELECT region FROM orders WHERE region = 'north'"),
        ]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();

        let record = controller(&fixture, &settings).run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Succeeded);
        let prompts = transcript.prompts();
        assert!(prompts[0].contains("Limit each SQL to 20 rows."));
        assert!(prompts[1].contains("Some few-shot examples after column exploration may be helpful:"));
        assert!(prompts[1].contains("Query:\nSELECT DISTINCT region FROM orders\nAnswer:\nregion\nnorth"));
        assert_eq!(record.generator_calls.len(), 2);
        assert_eq!(conversation.len(), 2);
        let log = fs::read_to_string(&fixture.artifacts.attempt(0).log).unwrap_or_default();
        assert!(log.contains("[Column exploration]"));
        let _ = fs::remove_dir_all(&fixture.root);
    }

    #[test]
    fn shared_answer_format_is_part_of_the_opening_request() {
        let fixture = fixture();
        let settings = RefinementSettings {
            enabled: false,
            ..RefinementSettings::default()
        };
        let generator = ScriptedGenerator::new([sql_reply("SELECT region FROM orders")]);
        let transcript = generator.transcript();
        let mut registry = registry_for(&fixture.target);
        let mut conversation = Conversation::new();
        let mut controller = controller(&fixture, &settings);
        controller.answer_format = Some("```csv\nregion\n```");

        let record = controller.run(&generator, &mut conversation, &mut registry);

        assert_eq!(record.state, AttemptState::Succeeded);
        assert!(transcript.prompts()[0].contains("Follow this answer format: ```csv\nregion\n```."));
        let _ = fs::remove_dir_all(&fixture.root);
    }
}
