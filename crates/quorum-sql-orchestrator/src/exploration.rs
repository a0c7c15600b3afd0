use std::collections::VecDeque;

use quorum_sql_backend::{BackendRegistry, BackendTarget, ExecutionLimits};
use quorum_sql_domain::{ExecutionOutcome, ExecutionStatus, TaskInstance};
use tracing::{debug, info, warn};

use crate::attempt_log::AttemptLog;
use crate::correction::{correct, select_longest, CorrectionOutcome, Session};
use crate::prompts::{exploration_followup_prompt, exploration_prompt};

/// A reply with fewer exploratory queries than this is asked for again.
const MIN_EXPLORATION_QUERIES: usize = 3;
/// Notes at or above this many characters are discarded and exploration is asked for again.
pub const EXPLORATION_NOTES_CHARS: usize = 100_000;
/// Consecutive failed repairs that end a batch.
const REPAIR_FAILURE_LIMIT: usize = 5;

/// An exploratory query that returned rows, with the rows as the generator will see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationNote {
    pub query: String,
    pub answer: String,
}

/// Runs small read-only queries ahead of generation so the first prompt can show real column
/// values.
pub struct ColumnExplorer<'a> {
    pub task: &'a TaskInstance,
    pub schema: &'a str,
    pub target: &'a BackendTarget,
    pub limits: ExecutionLimits,
    pub max_queries: usize,
    pub max_try: usize,
}

impl ColumnExplorer<'_> {
    /// Notes for the first generation request, or `None` when nothing usable came back.
    pub fn explore(
        &self,
        session: &mut Session<'_>,
        registry: &mut BackendRegistry,
        log: &mut AttemptLog,
    ) -> Option<String> {
        let prompt = exploration_prompt(self.task, self.schema, self.target.kind, self.max_queries);
        for _ in 0..self.max_try.max(1) {
            let mut queries = match session.ask(&prompt, "sql") {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(
                        instance_id = %self.task.instance_id,
                        error = %err,
                        "exploration request failed"
                    );
                    return None;
                }
            };
            log.section("Column exploration", session.last_reply().unwrap_or_default());
            if queries.len() == 1 {
                queries = split_statements(&queries[0]);
            }
            if queries.len() < MIN_EXPLORATION_QUERIES {
                debug!(queries = queries.len(), "too few exploratory queries, asking again");
                continue;
            }

            let notes = self.run_queries(queries, session, registry, log);
            if notes.is_empty() {
                info!(instance_id = %self.task.instance_id, "no exploratory query returned rows");
                return None;
            }
            let rendered = render_notes(&notes);
            if rendered.len() < EXPLORATION_NOTES_CHARS {
                info!(
                    instance_id = %self.task.instance_id,
                    notes = notes.len(),
                    "column exploration finished"
                );
                return Some(rendered);
            }
            debug!(chars = rendered.len(), "exploration notes too long, asking again");
        }
        None
    }

    /// Execute queries in order, repairing failures, until `max_queries` notes are collected.
    pub fn run_queries(
        &self,
        queries: Vec<String>,
        session: &mut Session<'_>,
        registry: &mut BackendRegistry,
        log: &mut AttemptLog,
    ) -> Vec<ExplorationNote> {
        let mut pending: VecDeque<String> = queries.into();
        let mut notes = Vec::new();
        let mut failed_repairs = 0;

        while let Some(query) = pending.pop_front() {
            if notes.len() >= self.max_queries {
                break;
            }
            let outcome = self.execute(registry, &query);
            if outcome.is_success() {
                notes.push(ExplorationNote {
                    query,
                    answer: outcome.signal(),
                });
                continue;
            }

            log.section("Error", &outcome.signal());
            match self.repair(&query, outcome, session, registry, log) {
                Some(note) => {
                    failed_repairs = 0;
                    if !pending.is_empty() {
                        propagate_fix(&query, &note.query, &mut pending, session, log);
                    }
                    notes.push(note);
                }
                None => {
                    failed_repairs += 1;
                    if failed_repairs >= REPAIR_FAILURE_LIMIT {
                        warn!(instance_id = %self.task.instance_id, "exploratory queries keep failing");
                        break;
                    }
                }
            }
        }
        notes
    }

    fn repair(
        &self,
        failed: &str,
        mut outcome: ExecutionOutcome,
        session: &mut Session<'_>,
        registry: &mut BackendRegistry,
        log: &mut AttemptLog,
    ) -> Option<ExplorationNote> {
        let mut query = failed.to_string();
        for _ in 0..self.max_try.max(1) {
            let simplify = outcome.status == ExecutionStatus::Empty;
            let corrected = match correct(session, &query, &outcome.signal(), simplify, self.max_try) {
                CorrectionOutcome::Candidates(candidates) => {
                    select_longest(&candidates).unwrap_or_default().to_string()
                }
                CorrectionOutcome::Invalid => continue,
            };
            outcome = self.execute(registry, &corrected);
            log.section("Corrected exploration result", &outcome.signal());
            query = corrected;
            if outcome.is_success() {
                return Some(ExplorationNote {
                    query,
                    answer: outcome.signal(),
                });
            }
        }
        None
    }

    fn execute(&self, registry: &mut BackendRegistry, query: &str) -> ExecutionOutcome {
        let outcome = registry.execute(self.target, query, None, &self.limits);
        debug!(status = outcome.status.as_str(), "exploratory query executed");
        outcome
    }
}

/// Ask for the same repair across the queries still waiting. The batch is replaced only when
/// the reply rewrites at least half of it.
fn propagate_fix(
    failed: &str,
    corrected: &str,
    pending: &mut VecDeque<String>,
    session: &mut Session<'_>,
    log: &mut AttemptLog,
) {
    let remaining: Vec<String> = pending.iter().cloned().collect();
    let prompt = exploration_followup_prompt(failed, corrected, &remaining);
    match session.ask(&prompt, "sql") {
        Ok(blocks) => {
            let revised: Vec<String> = blocks
                .iter()
                .flat_map(|block| split_statements(block))
                .collect();
            if !revised.is_empty() && revised.len() >= remaining.len() / 2 {
                log.section("Revised exploratory queries", session.last_reply().unwrap_or_default());
                *pending = revised.into();
            }
        }
        Err(err) => warn!(error = %err, "exploration follow-up failed"),
    }
}

/// `Query:`/`Answer:` pairs in collection order.
#[must_use]
pub fn render_notes(notes: &[ExplorationNote]) -> String {
    let mut rendered = String::new();
    for note in notes {
        rendered.push_str("Query:\n");
        rendered.push_str(&note.query);
        rendered.push_str("\nAnswer:\n");
        rendered.push_str(&note.answer);
        if !note.answer.ends_with('\n') {
            rendered.push('\n');
        }
    }
    rendered
}

/// Split a block holding several statements at `;`. Comment lines are never split, and
/// fragments holding only comments are dropped.
#[must_use]
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("--") || !line.contains(';') {
            current.push(line);
            continue;
        }
        let mut parts = line.split(';').peekable();
        while let Some(part) = parts.next() {
            current.push(part);
            if parts.peek().is_some() {
                push_statement(&mut statements, &current.join("\n"));
                current.clear();
            }
        }
    }
    push_statement(&mut statements, &current.join("\n"));
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let text = text.trim();
    let has_code = text
        .lines()
        .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"));
    if has_code {
        statements.push(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{render_notes, split_statements, ColumnExplorer, ExplorationNote};
    use crate::attempt_log::AttemptLog;
    use crate::correction::Session;
    use crate::testing::{fixture_db, registry_for, sql_reply, sqlite_task, temp_root};
    use quorum_sql_backend::{BackendTarget, ExecutionLimits};
    use quorum_sql_domain::Conversation;
    use quorum_sql_provider::ScriptedGenerator;
    use std::fs;

    #[test]
    fn statements_split_at_semicolons_but_not_inside_comments() {
        let block = "--Description: regions; all of them\nSELECT DISTINCT region FROM orders;\nSELECT id FROM orders LIMIT 20; SELECT 1;\n-- trailing note";
        assert_eq!(
            split_statements(block),
            vec![
                "--Description: regions; all of them\nSELECT DISTINCT region FROM orders".to_string(),
                "SELECT id FROM orders LIMIT 20".to_string(),
                "SELECT 1".to_string(),
            ]
        );
        assert!(split_statements("-- nothing here").is_empty());
    }

    #[test]
    fn failing_query_is_repaired_and_the_fix_applied_to_the_rest() {
        let root = temp_root("explore");
        let task = sqlite_task("local300", &fixture_db(&root));
        let target = BackendTarget::for_task(&task, None).unwrap_or_else(|_| unreachable!());
        let mut registry = registry_for(&target);
        let mut log = AttemptLog::open(&root.join("0log.log"));
        let generator = ScriptedGenerator::new([
            sql_reply("SELECT DISTINCT region FROM orders"),
            sql_reply("SELECT id FROM orders WHERE id < 3"),
        ]);
        let transcript = generator.transcript();
        let mut conversation = Conversation::new();
        let mut session = Session::new(&generator, &mut conversation);
        let explorer = ColumnExplorer {
            task: &task,
            schema: "",
            target: &target,
            limits: ExecutionLimits::default(),
            max_queries: 10,
            max_try: 3,
        };

        let notes = explorer.run_queries(
            vec![
                "SELECT DISTINCT regoin FROM orders".to_string(),
                "SELECT idd FROM orders WHERE idd < 3".to_string(),
                "SELECT MAX(amout) FROM orders".to_string(),
            ],
            &mut session,
            &mut registry,
            &mut log,
        );

        let queries: Vec<&str> = notes.iter().map(|note| note.query.as_str()).collect();
        assert_eq!(
            queries,
            vec!["SELECT DISTINCT region FROM orders", "SELECT id FROM orders WHERE id < 3"]
        );
        assert!(notes[0].answer.starts_with("region\n"));
        assert!(transcript.prompts()[0].contains("no such column: regoin"));
        assert!(transcript.prompts()[1].contains("was corrected to"));
        assert_eq!(registry.executions(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn notes_render_as_query_answer_pairs() {
        let notes = [
            ExplorationNote {
                query: "SELECT 1".to_string(),
                answer: "1\n1\n".to_string(),
            },
            ExplorationNote {
                query: "SELECT 2".to_string(),
                answer: "2\n2".to_string(),
            },
        ];
        assert_eq!(
            render_notes(&notes),
            "Query:\nSELECT 1\nAnswer:\n1\n1\nQuery:\nSELECT 2\nAnswer:\n2\n2\n"
        );
    }
}
