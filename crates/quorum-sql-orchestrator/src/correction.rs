use quorum_sql_domain::{hash_bytes, now_utc, Conversation, GeneratorCallRecord};
use quorum_sql_provider::{submit, Generator};
use tracing::warn;
use ulid::Ulid;

use crate::prompts::{correction_prompt, CORRECTION_REMINDER, SINGLE_BLOCK_REMINDER};

/// A generator bound to one attempt's conversation, keeping a record of every call.
pub struct Session<'a> {
    generator: &'a dyn Generator,
    conversation: &'a mut Conversation,
    calls: Vec<GeneratorCallRecord>,
    last_reply: Option<String>,
    last_failure: Option<String>,
}

impl<'a> Session<'a> {
    pub fn new(generator: &'a dyn Generator, conversation: &'a mut Conversation) -> Self {
        Self {
            generator,
            conversation,
            calls: Vec::new(),
            last_reply: None,
            last_failure: None,
        }
    }

    /// Send one prompt and return the fenced blocks of `block_kind` in the reply.
    ///
    /// # Errors
    /// Returns the generator's transport error; the failed call is still recorded.
    pub fn ask(&mut self, prompt: &str, block_kind: &str) -> anyhow::Result<Vec<String>> {
        let started_at = now_utc();
        match submit(self.generator, self.conversation, prompt, block_kind) {
            Ok(exchange) => {
                self.calls.push(exchange.call);
                self.last_reply = Some(exchange.reply);
                Ok(exchange.blocks)
            }
            Err(err) => {
                let message = err.to_string();
                self.calls.push(GeneratorCallRecord {
                    call_id: Ulid::new(),
                    generator_name: self.generator.generator_name().to_string(),
                    model_id: self.generator.model_id().to_string(),
                    request_hash: hash_bytes(prompt.as_bytes()),
                    response_hash: hash_bytes(b""),
                    latency_ms: None,
                    started_at,
                    ended_at: now_utc(),
                    status: "failed".to_string(),
                    error_text: Some(message.clone()),
                });
                self.last_failure = Some(message);
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn last_reply(&self) -> Option<&str> {
        self.last_reply.as_deref()
    }

    /// Transport error of the most recent failed call, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    #[must_use]
    pub fn calls(&self) -> &[GeneratorCallRecord] {
        &self.calls
    }

    #[must_use]
    pub fn into_calls(self) -> Vec<GeneratorCallRecord> {
        self.calls
    }
}

/// Ask until the reply carries exactly one `sql` block, re-prompting with a reminder.
/// At most `max_try` requests are made.
///
/// # Errors
/// Returns the generator's transport error.
pub fn request_single_block(
    session: &mut Session<'_>,
    prompt: &str,
    max_try: usize,
) -> anyhow::Result<Option<String>> {
    let mut prompt = prompt.to_string();
    for _ in 0..max_try.max(1) {
        let mut blocks = session.ask(&prompt, "sql")?;
        if blocks.len() == 1 {
            return Ok(blocks.pop());
        }
        prompt = SINGLE_BLOCK_REMINDER.to_string();
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    Candidates(Vec<String>),
    Invalid,
}

/// Ask for a corrected query. At most `max_try` correction requests are sent; a reply that is
/// still ambiguous after the last one is returned as several candidates.
pub fn correct(
    session: &mut Session<'_>,
    failing_query: &str,
    error_description: &str,
    simplify_hint: bool,
    max_try: usize,
) -> CorrectionOutcome {
    let mut prompt = correction_prompt(failing_query, error_description, simplify_hint);
    let mut last_blocks = Vec::new();
    for _ in 0..max_try.max(1) {
        match session.ask(&prompt, "sql") {
            Ok(blocks) if blocks.len() == 1 => return CorrectionOutcome::Candidates(blocks),
            Ok(blocks) => last_blocks = blocks,
            Err(err) => {
                warn!(error = %err, "correction request failed");
                return CorrectionOutcome::Invalid;
            }
        }
        prompt = CORRECTION_REMINDER.to_string();
    }
    if last_blocks.is_empty() {
        CorrectionOutcome::Invalid
    } else {
        CorrectionOutcome::Candidates(last_blocks)
    }
}

/// Longest candidate by character count; the earliest one wins a tie.
#[must_use]
pub fn select_longest(candidates: &[String]) -> Option<&str> {
    candidates
        .iter()
        .fold(None::<&String>, |best, candidate| match best {
            Some(best) if best.chars().count() >= candidate.chars().count() => Some(best),
            _ => Some(candidate),
        })
        .map(String::as_str)
}
