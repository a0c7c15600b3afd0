#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use quorum_sql_domain::{
    hash_json, now_utc, Conversation, ConversationRole, GeneratorBinding, GeneratorCallRecord,
};
use serde_json::{json, Value};
use tracing::debug;
use ulid::Ulid;

/// A conversational text-generation service.
pub trait Generator: Send {
    fn generator_name(&self) -> &'static str;

    fn model_id(&self) -> &str;

    /// Produce the assistant reply to the conversation as it stands.
    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, conversation: &Conversation) -> Result<String>;
}

/// Which session a factory is opening; attempts never share one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionRole {
    Attempt(usize),
    /// The one request per task that guesses the answer's header.
    AnswerFormat,
    Judge,
}

pub trait GeneratorFactory: Sync {
    #[allow(clippy::missing_errors_doc)]
    fn open_session(&self, role: SessionRole) -> Result<Box<dyn Generator>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub blocks: Vec<String>,
    pub reply: String,
    pub call: GeneratorCallRecord,
}

/// Append `prompt` to the conversation, ask the generator, append its reply, and return every
/// fenced block of `block_kind` found in the reply.
///
/// # Errors
/// Returns an error when the generator call itself fails.
pub fn submit(
    generator: &dyn Generator,
    conversation: &mut Conversation,
    prompt: &str,
    block_kind: &str,
) -> Result<Exchange> {
    conversation.push(ConversationRole::User, prompt);
    let started_at = now_utc();
    let request_json = json!({
        "generator_name": generator.generator_name(),
        "model_id": generator.model_id(),
        "block_kind": block_kind,
        "turns": conversation.turns(),
    });
    let request_hash = hash_json(&request_json)?;

    let reply = generator.complete(conversation)?;
    conversation.push(ConversationRole::Assistant, reply.clone());

    let ended_at = now_utc();
    let blocks = extract_blocks(&reply, block_kind);
    let response_hash = hash_json(&json!({ "reply": reply }))?;
    let latency_ms = {
        let millis = (ended_at - started_at).whole_milliseconds();
        if millis <= 0 {
            Some(0)
        } else {
            u64::try_from(millis).ok()
        }
    };
    debug!(
        generator = generator.generator_name(),
        blocks = blocks.len(),
        turns = conversation.len(),
        "generator exchange finished"
    );

    Ok(Exchange {
        blocks,
        reply,
        call: GeneratorCallRecord {
            call_id: Ulid::new(),
            generator_name: generator.generator_name().to_string(),
            model_id: generator.model_id().to_string(),
            request_hash,
            response_hash,
            latency_ms,
            started_at,
            ended_at,
            status: "succeeded".to_string(),
            error_text: None,
        },
    })
}

/// Contents of every ```` ```kind ```` fenced block, trimmed, in order of appearance.
#[must_use]
pub fn extract_blocks(text: &str, kind: &str) -> Vec<String> {
    let opener = format!("```{kind}");
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(&opener) {
        let after = &rest[start + opener.len()..];
        // `sql` must not match the opener of `sqlite`.
        if after
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            rest = after;
            continue;
        }
        match after.find("```") {
            Some(end) => {
                blocks.push(after[..end].trim().to_string());
                rest = &after[end + 3..];
            }
            None => break,
        }
    }

    blocks
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GeneratorKind {
    ChatCompletions,
    Scripted,
}

impl GeneratorKind {
    /// # Errors
    /// Returns an error for provider names outside the supported set.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "chat_completions" => Ok(Self::ChatCompletions),
            "scripted" => Ok(Self::Scripted),
            other => Err(anyhow!(
                "unsupported generator provider '{other}'; supported providers are 'chat_completions' and 'scripted'"
            )),
        }
    }
}

/// Build a generator session from a profile binding.
///
/// # Errors
/// Returns an error when the provider is unknown or its params are invalid.
pub fn build_generator(binding: &GeneratorBinding) -> Result<Box<dyn Generator>> {
    match GeneratorKind::parse(&binding.provider_name)? {
        GeneratorKind::ChatCompletions => Ok(Box::new(ChatCompletionsGenerator::from_binding(
            binding,
        )?)),
        GeneratorKind::Scripted => Ok(Box::new(ScriptedGenerator::from_binding(binding)?)),
    }
}

/// Opens sessions from the profile's `generator` and optional `judge` bindings.
#[derive(Debug, Clone)]
pub struct BindingGeneratorFactory {
    generator: GeneratorBinding,
    judge: Option<GeneratorBinding>,
}

impl BindingGeneratorFactory {
    #[must_use]
    pub fn new(generator: GeneratorBinding, judge: Option<GeneratorBinding>) -> Self {
        Self { generator, judge }
    }
}

impl GeneratorFactory for BindingGeneratorFactory {
    fn open_session(&self, role: SessionRole) -> Result<Box<dyn Generator>> {
        match role {
            SessionRole::Attempt(_) | SessionRole::AnswerFormat => build_generator(&self.generator),
            SessionRole::Judge => {
                let binding = self
                    .judge
                    .as_ref()
                    .ok_or_else(|| anyhow!("no judge generator is configured"))?;
                build_generator(binding)
            }
        }
    }
}

/// OpenAI-compatible `chat/completions` endpoint over HTTP.
pub struct ChatCompletionsGenerator {
    model_id: String,
    config: ChatConfig,
    agent: ureq::Agent,
}

impl ChatCompletionsGenerator {
    /// # Errors
    /// Returns an error when `params.url` is missing or other params are malformed.
    pub fn from_binding(binding: &GeneratorBinding) -> Result<Self> {
        let config = ChatConfig::from_params(&binding.params)?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Ok(Self {
            model_id: binding.model_id.clone(),
            config,
            agent,
        })
    }

    fn outbound_json(&self, conversation: &Conversation) -> Value {
        let messages: Vec<Value> = conversation
            .turns()
            .iter()
            .map(|turn| {
                json!({
                    "role": role_name(turn.role),
                    "content": turn.content,
                })
            })
            .collect();
        let mut body = json!({
            "model": self.model_id,
            "messages": messages,
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

impl Generator for ChatCompletionsGenerator {
    fn generator_name(&self) -> &'static str {
        "chat_completions"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn complete(&self, conversation: &Conversation) -> Result<String> {
        let mut req = self
            .agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.api_key {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(self.outbound_json(conversation)) {
            Ok(response) => {
                let body: Value = response.into_json()?;
                parse_chat_reply(&body)
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!("chat completion failed with http status {code}: {body}"))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }
}

/// Pull `choices[0].message.content` out of a chat completion body.
///
/// # Errors
/// Returns an error when the body has no textual first choice.
pub fn parse_chat_reply(body: &Value) -> Result<String> {
    body.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("chat completion response has no choices[0].message.content"))
}

fn role_name(role: ConversationRole) -> &'static str {
    match role {
        ConversationRole::System => "system",
        ConversationRole::User => "user",
        ConversationRole::Assistant => "assistant",
    }
}

#[derive(Debug, Clone)]
struct ChatConfig {
    url: String,
    timeout_ms: u64,
    temperature: Option<f64>,
    headers: BTreeMap<String, String>,
    api_key: Option<String>,
}

impl ChatConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("chat_completions generator requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(120_000);
        let temperature = params.get("temperature").and_then(Value::as_f64);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let api_key = if let Some(env_name) = params.get("api_key_env").and_then(Value::as_str) {
            Some(std::env::var(env_name).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by params.api_key_env")
            })?)
        } else {
            None
        };

        Ok(Self {
            url,
            timeout_ms,
            temperature,
            headers,
            api_key,
        })
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<String>,
    prompts: Vec<String>,
    calls: usize,
}

/// Replays a fixed list of replies in order. Every session gets its own copy of the script.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    model_id: String,
    state: Arc<Mutex<ScriptState>>,
}

/// Read-only view onto a scripted session that stays valid after the session is handed off.
#[derive(Debug, Clone)]
pub struct ScriptTranscript {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptTranscript {
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().map(|state| state.calls).unwrap_or(0)
    }

    /// The latest user prompt seen by each call, in order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.prompts.clone())
            .unwrap_or_default()
    }
}

impl ScriptedGenerator {
    #[must_use]
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model_id: "scripted".to_string(),
            state: Arc::new(Mutex::new(ScriptState {
                replies: replies.into_iter().map(Into::into).collect(),
                prompts: Vec::new(),
                calls: 0,
            })),
        }
    }

    /// # Errors
    /// Returns an error when `params.replies` is missing or not a list of strings.
    pub fn from_binding(binding: &GeneratorBinding) -> Result<Self> {
        let replies = binding
            .params
            .get("replies")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("scripted generator requires params.replies"))?
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("params.replies entries must be strings"))
            })
            .collect::<Result<Vec<String>>>()?;
        let mut generator = Self::new(replies);
        generator.model_id.clone_from(&binding.model_id);
        Ok(generator)
    }

    #[must_use]
    pub fn transcript(&self) -> ScriptTranscript {
        ScriptTranscript {
            state: Arc::clone(&self.state),
        }
    }
}

impl Generator for ScriptedGenerator {
    fn generator_name(&self) -> &'static str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn complete(&self, conversation: &Conversation) -> Result<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("scripted generator state is poisoned"))?;
        state.calls += 1;
        let prompt = conversation
            .turns()
            .iter()
            .rev()
            .find(|turn| turn.role == ConversationRole::User)
            .map(|turn| turn.content.clone())
            .unwrap_or_default();
        state.prompts.push(prompt);
        state
            .replies
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator ran out of replies"))
    }
}
