#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use quorum_sql_domain::{
    ensure_non_empty, hash_bytes, hash_json, BackendKind, GeneratorBinding, TaskInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const NORMALIZATION_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    /// Forces every task onto one backend instead of inferring it from the instance id.
    #[serde(default)]
    pub kind: Option<BackendKind>,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    /// Program spawned for isolated `SQLite` execution; defaults to the running executable.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LimitSettings {
    pub size_limit_bytes: usize,
    pub time_limit_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            size_limit_bytes: 30_000,
            time_limit_ms: 300_000,
            grace_period_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
#[allow(clippy::struct_excessive_bools)]
pub struct RefinementSettings {
    pub enabled: bool,
    pub max_iter: usize,
    pub max_try: usize,
    pub failure_streak_limit: usize,
    pub early_stop: bool,
    pub early_stop_window: usize,
    pub self_consistency: bool,
    pub keep_all_iterations: bool,
    pub ignore_row_order: bool,
    /// Run exploratory queries before the first generation request and show their results.
    pub column_exploration: bool,
    /// Exploratory results kept per attempt.
    pub exploration_max_queries: usize,
    /// Ask the generator once per task for the expected answer header when the task has no
    /// `format_hint`.
    pub format_restriction: bool,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iter: 5,
            max_try: 3,
            failure_streak_limit: 5,
            early_stop: true,
            early_stop_window: 4,
            self_consistency: true,
            keep_all_iterations: false,
            ignore_row_order: true,
            column_exploration: false,
            exploration_max_queries: 10,
            format_restriction: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct VotingSettings {
    pub enabled: bool,
    pub num_votes: usize,
    pub force_revote: bool,
    pub judge_on_tie: bool,
    pub pick_first_on_tie: bool,
}

impl Default for VotingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            num_votes: 3,
            force_revote: false,
            judge_on_tie: false,
            pick_first_on_tie: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSettings {
    pub num_workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { num_workers: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunProfile {
    pub profile_name: String,
    pub profile_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    pub generator: GeneratorBinding,
    #[serde(default)]
    pub judge: Option<GeneratorBinding>,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub refinement: RefinementSettings,
    #[serde(default)]
    pub voting: VotingSettings,
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunProfileEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub profile: RunProfile,
    pub normalized_json: Value,
}

/// Load a run profile YAML from disk and normalize it into canonical form.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_profile_from_path(path: &Path) -> Result<RunProfileEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    normalize_profile_yaml(&content)
}

/// Normalize profile YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_profile_yaml(yaml: &str) -> Result<RunProfileEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut profile: RunProfile = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid run profile YAML structure: {err}"))?;

    validate_profile(&profile)?;
    normalize_profile(&mut profile);
    validate_profile(&profile)?;

    let normalized_json = serde_json::to_value(&profile)?;
    let normalized_hash = hash_json(&normalized_json)?;
    debug!(
        profile = %profile.profile_name,
        hash = %normalized_hash,
        "run profile normalized"
    );

    Ok(RunProfileEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        profile,
        normalized_json,
    })
}

fn validate_profile(profile: &RunProfile) -> Result<()> {
    ensure_non_empty("profile_name", &profile.profile_name)?;
    ensure_non_empty("profile_version", &profile.profile_version)?;
    validate_binding("generator", &profile.generator)?;
    if let Some(judge) = &profile.judge {
        validate_binding("judge", judge)?;
    }

    ensure_positive("limits.size_limit_bytes", profile.limits.size_limit_bytes)?;
    if profile.limits.time_limit_ms == 0 {
        return Err(anyhow!("limits.time_limit_ms MUST be positive"));
    }

    let refinement = &profile.refinement;
    ensure_positive("refinement.max_iter", refinement.max_iter)?;
    ensure_positive("refinement.max_try", refinement.max_try)?;
    ensure_positive(
        "refinement.failure_streak_limit",
        refinement.failure_streak_limit,
    )?;
    ensure_positive("refinement.early_stop_window", refinement.early_stop_window)?;
    if refinement.column_exploration {
        ensure_positive(
            "refinement.exploration_max_queries",
            refinement.exploration_max_queries,
        )?;
    }

    ensure_positive("voting.num_votes", profile.voting.num_votes)?;
    if profile.voting.judge_on_tie && profile.judge.is_none() {
        return Err(anyhow!(
            "voting.judge_on_tie requires a `judge` generator binding"
        ));
    }

    ensure_positive("pool.num_workers", profile.pool.num_workers)?;
    Ok(())
}

fn validate_binding(section: &str, binding: &GeneratorBinding) -> Result<()> {
    ensure_non_empty(&format!("{section}.provider_name"), &binding.provider_name)?;
    ensure_non_empty(&format!("{section}.model_id"), &binding.model_id)?;
    Ok(())
}

fn ensure_positive(field_name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(anyhow!("{field_name} MUST be positive"));
    }
    Ok(())
}

fn normalize_profile(profile: &mut RunProfile) {
    profile.normalization_version = NORMALIZATION_VERSION;
    profile.profile_name = profile.profile_name.trim().to_string();
    profile.profile_version = profile.profile_version.trim().to_string();

    normalize_binding(&mut profile.generator);
    if let Some(judge) = &mut profile.judge {
        normalize_binding(judge);
    }
}

fn normalize_binding(binding: &mut GeneratorBinding) {
    binding.provider_name = binding.provider_name.trim().to_ascii_lowercase();
    binding.model_id = binding.model_id.trim().to_string();
    if binding.params.is_null() {
        binding.params = Value::Object(serde_json::Map::new());
    }
}

/// Load a JSON-lines task manifest. Relative `db_path`/`schema_path` entries resolve against
/// the manifest's directory and `schema_path` contents are read into `schema_text`.
///
/// # Errors
/// Returns an error on unreadable files, malformed lines, empty ids/questions, or duplicate ids.
pub fn load_tasks_from_path(path: &Path) -> Result<Vec<TaskInstance>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read task manifest {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_task_manifest(&content, base_dir)
}

/// Parse manifest text; see [`load_tasks_from_path`].
///
/// # Errors
/// Returns an error on malformed lines, empty ids/questions, duplicate ids, or unreadable schema files.
pub fn parse_task_manifest(content: &str, base_dir: &Path) -> Result<Vec<TaskInstance>> {
    let mut seen = BTreeSet::new();
    let mut tasks = Vec::new();

    for (line_index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut task: TaskInstance = serde_json::from_str(line)
            .with_context(|| format!("invalid task on manifest line {}", line_index + 1))?;
        ensure_non_empty("instance_id", &task.instance_id)?;
        ensure_non_empty("question", &task.question)?;
        if !seen.insert(task.instance_id.clone()) {
            return Err(anyhow!("duplicate instance_id: {}", task.instance_id));
        }

        if let Some(db_path) = &task.db_path {
            if db_path.is_relative() {
                task.db_path = Some(base_dir.join(db_path));
            }
        }
        if let Some(schema_path) = &task.schema_path {
            let resolved = if schema_path.is_relative() {
                base_dir.join(schema_path)
            } else {
                schema_path.clone()
            };
            if task.schema_text.is_none() {
                let schema = fs::read_to_string(&resolved).with_context(|| {
                    format!(
                        "failed to read schema for {} at {}",
                        task.instance_id,
                        resolved.display()
                    )
                })?;
                task.schema_text = Some(schema);
            }
            task.schema_path = Some(resolved);
        }
        tasks.push(task);
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::{normalize_profile_yaml, parse_task_manifest};
    use quorum_sql_domain::BackendKind;
    use std::path::Path;

    const PROFILE: &str = r"
profile_name: lite
profile_version: v1
generator:
  provider_name: Chat_Completions
  model_id: gpt-4o
  params:
    url: http://localhost:9999/v1/chat/completions
voting:
  num_votes: 3
  pick_first_on_tie: true
";

    #[test]
    fn normalize_hash_is_stable() {
        let first = normalize_profile_yaml(PROFILE);
        let second = normalize_profile_yaml(PROFILE);
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => {
                assert_eq!(first.normalized_hash, second.normalized_hash);
                assert_eq!(first.profile.generator.provider_name, "chat_completions");
                assert_eq!(first.profile.normalization_version, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let envelope = normalize_profile_yaml(PROFILE).unwrap_or_else(|_| unreachable!());
        let profile = envelope.profile;
        assert_eq!(profile.limits.size_limit_bytes, 30_000);
        assert_eq!(profile.limits.time_limit_ms, 300_000);
        assert_eq!(profile.refinement.max_iter, 5);
        assert_eq!(profile.refinement.max_try, 3);
        assert_eq!(profile.refinement.failure_streak_limit, 5);
        assert_eq!(profile.refinement.early_stop_window, 4);
        assert_eq!(profile.pool.num_workers, 16);
        assert!(profile.voting.pick_first_on_tie);
        assert!(!profile.voting.judge_on_tie);
        assert!(!profile.refinement.column_exploration);
        assert!(!profile.refinement.format_restriction);
    }

    #[test]
    fn column_exploration_needs_a_query_budget() {
        let yaml = r"
profile_name: lite
profile_version: v1
generator:
  provider_name: scripted
  model_id: m
refinement:
  column_exploration: true
  exploration_max_queries: 0
";
        let result = normalize_profile_yaml(yaml);
        assert!(result.is_err());
        let message = result.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(message.contains("exploration_max_queries"));

        let enabled = normalize_profile_yaml(&yaml.replace("exploration_max_queries: 0", "format_restriction: true"))
            .unwrap_or_else(|_| unreachable!());
        assert!(enabled.profile.refinement.column_exploration);
        assert_eq!(enabled.profile.refinement.exploration_max_queries, 10);
        assert!(enabled.profile.refinement.format_restriction);
    }

    #[test]
    fn judge_on_tie_requires_judge_binding() {
        let yaml = r"
profile_name: lite
profile_version: v1
generator:
  provider_name: scripted
  model_id: m
voting:
  judge_on_tie: true
";
        let result = normalize_profile_yaml(yaml);
        assert!(result.is_err());
        let message = result.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(message.contains("judge"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r"
profile_name: lite
profile_version: v1
generator:
  provider_name: scripted
  model_id: m
refinement:
  max_iterations: 9
";
        assert!(normalize_profile_yaml(yaml).is_err());
    }

    #[test]
    fn manifest_resolves_paths_and_rejects_duplicates() {
        let dir = std::env::temp_dir().join(format!("quorum-sql-manifest-{}", ulid::Ulid::new()));
        assert!(std::fs::create_dir_all(&dir).is_ok());
        assert!(std::fs::write(dir.join("schema.txt"), "CREATE TABLE t(x INT);").is_ok());

        let manifest = r#"
{"instance_id": "local001", "question": "count rows", "db_path": "db.sqlite", "schema_path": "schema.txt"}
{"instance_id": "sf001", "question": "top sellers", "format_hint": "name,total"}
"#;
        let tasks = parse_task_manifest(manifest, &dir);
        assert!(tasks.is_ok());
        let tasks = tasks.unwrap_or_else(|_| unreachable!());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].db_path.as_deref(), Some(dir.join("db.sqlite").as_path()));
        assert_eq!(
            tasks[0].schema_text.as_deref(),
            Some("CREATE TABLE t(x INT);")
        );
        assert!(matches!(tasks[1].backend_kind(), Ok(BackendKind::Snowflake)));

        let duplicated = r#"
{"instance_id": "local001", "question": "a"}
{"instance_id": "local001", "question": "b"}
"#;
        assert!(parse_task_manifest(duplicated, Path::new(".")).is_err());
    }
}
