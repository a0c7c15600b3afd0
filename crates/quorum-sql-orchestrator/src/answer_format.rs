use quorum_sql_domain::{Conversation, GeneratorCallRecord, TaskInstance};
use quorum_sql_profile::RefinementSettings;
use quorum_sql_provider::{GeneratorFactory, SessionRole};
use tracing::{info, warn};

use crate::correction::Session;
use crate::prompts::answer_format_prompt;

/// The answer shape every attempt of a task is asked to follow, and the calls spent finding it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerFormat {
    pub text: Option<String>,
    pub calls: Vec<GeneratorCallRecord>,
}

/// A task's own `format_hint` wins. Otherwise, with `format_restriction` on, one generator call
/// guesses the header of the answer table. A failed guess leaves the prompts without a format.
pub fn resolve_answer_format(
    generators: &dyn GeneratorFactory,
    task: &TaskInstance,
    settings: &RefinementSettings,
) -> AnswerFormat {
    if let Some(hint) = &task.format_hint {
        return AnswerFormat {
            text: Some(hint.clone()),
            calls: Vec::new(),
        };
    }
    if !settings.format_restriction {
        return AnswerFormat::default();
    }

    let generator = match generators.open_session(SessionRole::AnswerFormat) {
        Ok(generator) => generator,
        Err(err) => {
            warn!(instance_id = %task.instance_id, error = %err, "answer format session unavailable");
            return AnswerFormat::default();
        }
    };
    let mut conversation = Conversation::new();
    let mut session = Session::new(generator.as_ref(), &mut conversation);
    let text = match session.ask(&answer_format_prompt(task), "csv") {
        Ok(blocks) => blocks.first().and_then(|block| header_line(block)),
        Err(err) => {
            warn!(instance_id = %task.instance_id, error = %err, "answer format request failed");
            None
        }
    };
    match &text {
        Some(format) => info!(instance_id = %task.instance_id, format = %format, "answer format chosen"),
        None => warn!(instance_id = %task.instance_id, "no answer format in reply"),
    }
    AnswerFormat {
        text,
        calls: session.into_calls(),
    }
}

/// The first non-blank line of the block, re-fenced as csv.
fn header_line(block: &str) -> Option<String> {
    block
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|header| format!("```csv\n{header}\n```"))
}
