use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use quorum_sql_backend::render_csv;
use quorum_sql_consensus::{ConsensusCandidate, Judge, JudgeVerdict, JUDGE_EXCERPT_CHARS};
use quorum_sql_domain::{hard_cut, Conversation, GeneratorCallRecord, TaskInstance};
use quorum_sql_provider::Generator;
use tracing::{info, warn};

use crate::artifacts::AttemptPaths;
use crate::correction::Session;
use crate::prompts::{judge_prompt, JudgeOption, JUDGE_REMINDER};

const JUDGE_RETRIES: usize = 3;

/// Breaks ties by asking a generator to name the best `{i}result.sql`.
pub struct GeneratorJudge<'a> {
    generator: Box<dyn Generator>,
    task: &'a TaskInstance,
    schema: &'a str,
    vote_log: PathBuf,
    calls: RefCell<Vec<GeneratorCallRecord>>,
}

impl<'a> GeneratorJudge<'a> {
    #[must_use]
    pub fn new(
        generator: Box<dyn Generator>,
        task: &'a TaskInstance,
        schema: &'a str,
        vote_log: PathBuf,
    ) -> Self {
        Self {
            generator,
            task,
            schema,
            vote_log,
            calls: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn into_calls(self) -> Vec<GeneratorCallRecord> {
        self.calls.into_inner()
    }

    fn converse(
        session: &mut Session<'_>,
        prompt: &str,
        options: &[&ConsensusCandidate],
    ) -> Result<Option<usize>> {
        let mut blocks = session.ask(prompt, "plaintext")?;
        for retry in 0..=JUDGE_RETRIES {
            if let Some(chosen) = named_option(&blocks, options) {
                return Ok(Some(chosen));
            }
            if retry == JUDGE_RETRIES {
                break;
            }
            blocks = session.ask(JUDGE_REMINDER, "plaintext")?;
        }
        Ok(None)
    }
}

fn option_view(candidate: &ConsensusCandidate) -> JudgeOption {
    let csv_text = fs::read_to_string(&candidate.csv_artifact)
        .or_else(|_| render_csv(&candidate.table))
        .unwrap_or_default();
    JudgeOption {
        sql_name: AttemptPaths::file_name(&candidate.sql_artifact),
        sql: candidate.sql.clone(),
        csv_name: AttemptPaths::file_name(&candidate.csv_artifact),
        csv_excerpt: hard_cut(&csv_text, JUDGE_EXCERPT_CHARS).0,
    }
}

/// Attempt index of the option whose query file the first block names.
fn named_option(blocks: &[String], options: &[&ConsensusCandidate]) -> Option<usize> {
    let named = blocks.first()?.trim();
    if !named.contains(".sql") {
        return None;
    }
    options
        .iter()
        .find(|option| AttemptPaths::file_name(&option.sql_artifact) == named)
        .map(|option| option.attempt_index)
}

impl Judge for GeneratorJudge<'_> {
    fn choose(&self, options: &[&ConsensusCandidate]) -> Result<JudgeVerdict> {
        let views: Vec<JudgeOption> = options.iter().map(|option| option_view(option)).collect();
        let prompt = judge_prompt(self.task, self.schema, &views);

        let mut conversation = Conversation::new();
        let mut session = Session::new(self.generator.as_ref(), &mut conversation);
        let chosen = Self::converse(&mut session, &prompt, options);
        let reply = session.last_reply().unwrap_or_default().to_string();
        self.calls.borrow_mut().extend(session.into_calls());
        let chosen = chosen?;

        let transcript = format!("[Vote]\n{prompt}\n[Vote]\n{reply}");
        match chosen {
            Some(attempt) => {
                info!(instance_id = %self.task.instance_id, attempt, "judge chose an answer");
                if let Err(err) = fs::write(&self.vote_log, &transcript) {
                    warn!(path = %self.vote_log.display(), error = %err, "failed to write vote log");
                }
            }
            None => warn!(instance_id = %self.task.instance_id, "judge named no known query"),
        }
        Ok(JudgeVerdict { chosen, transcript })
    }
}

#[cfg(test)]
mod tests {
    use super::GeneratorJudge;
    use crate::artifacts::TaskArtifacts;
    use crate::testing::{sqlite_task, temp_root};
    use quorum_sql_consensus::{ConsensusCandidate, Judge};
    use quorum_sql_domain::{Cell, ResultTable};
    use quorum_sql_provider::ScriptedGenerator;
    use std::fs;
    use std::path::Path;

    fn candidate(artifacts: &TaskArtifacts, index: usize, value: i64) -> ConsensusCandidate {
        let paths = artifacts.attempt(index);
        let sql = format!("SELECT {value} AS n");
        assert!(fs::write(&paths.sql, &sql).is_ok());
        assert!(fs::write(&paths.csv, format!("n\n{value}\n")).is_ok());
        ConsensusCandidate {
            attempt_index: index,
            sql,
            table: ResultTable::new(vec!["n".to_string()], vec![vec![Cell::Integer(value)]]),
            sql_artifact: paths.sql,
            csv_artifact: paths.csv,
        }
    }

    #[test]
    fn judge_reprompts_until_a_known_file_is_named() {
        let root = temp_root("judge");
        let task = sqlite_task("local020", Path::new("unused.sqlite"));
        let artifacts = TaskArtifacts::new(&root, &task.instance_id);
        assert!(artifacts.ensure_dir().is_ok());
        let first = candidate(&artifacts, 0, 1);
        let second = candidate(&artifacts, 1, 2);

        let generator = ScriptedGenerator::new([
            "I pick the second one.",
            "```plaintext\n7result.sql\n```",
            "```plaintext\n1result.sql\n```",
        ]);
        let transcript = generator.transcript();
        let judge = GeneratorJudge::new(Box::new(generator), &task, "schema", artifacts.vote_log());

        let verdict = judge.choose(&[&first, &second]);
        assert!(verdict.is_ok());
        let verdict = verdict.unwrap_or_else(|_| unreachable!());

        assert_eq!(verdict.chosen, Some(1));
        assert_eq!(transcript.calls(), 3);
        assert!(transcript.prompts()[0].contains("SQL file name: 0result.sql"));
        assert!(transcript.prompts()[0].contains("CSV file name: 1result.csv"));
        let vote_log = fs::read_to_string(artifacts.vote_log()).unwrap_or_default();
        assert!(vote_log.starts_with("[Vote]\n"));
        assert!(vote_log.ends_with("```plaintext\n1result.sql\n```"));
        assert_eq!(judge.into_calls().len(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn judge_gives_up_after_retries() {
        let root = temp_root("judge-none");
        let task = sqlite_task("local021", Path::new("unused.sqlite"));
        let artifacts = TaskArtifacts::new(&root, &task.instance_id);
        assert!(artifacts.ensure_dir().is_ok());
        let first = candidate(&artifacts, 0, 1);
        let second = candidate(&artifacts, 1, 2);

        let generator = ScriptedGenerator::new(vec!["no idea"; 4]);
        let judge = GeneratorJudge::new(Box::new(generator), &task, "schema", artifacts.vote_log());

        let verdict = judge.choose(&[&first, &second]).unwrap_or_else(|_| unreachable!());

        assert_eq!(verdict.chosen, None);
        assert!(!artifacts.vote_log().exists());
        let _ = fs::remove_dir_all(root);
    }
}
