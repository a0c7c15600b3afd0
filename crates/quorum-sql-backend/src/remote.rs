use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use quorum_sql_domain::{BackendKind, Cell, ExecutionOutcome};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{materialize, BackendError, ExecutionLimits, FetchedRows, QueryBackend, RowAccumulator};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Fetch {
    Done(FetchedRows),
    TimedOut,
}

fn resolve_secret(
    inline: Option<&String>,
    env_name: Option<&String>,
    field: &str,
) -> Result<String, BackendError> {
    if let Some(value) = inline {
        return Ok(value.clone());
    }
    if let Some(env_name) = env_name {
        return std::env::var(env_name).map_err(|_| {
            BackendError::Credentials(format!("missing env var '{env_name}' for {field}"))
        });
    }
    Err(BackendError::Credentials(format!(
        "{field} or {field}_env must be set"
    )))
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, BackendError> {
    let content = fs::read_to_string(path).map_err(|err| {
        BackendError::Credentials(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|err| BackendError::Credentials(format!("{}: {err}", path.display())))
}

fn remaining_secs(deadline: Instant) -> u64 {
    deadline
        .saturating_duration_since(Instant::now())
        .as_secs()
        .max(1)
}

/// Turn a rejected HTTP call into a query error carrying the service's own message.
fn status_error(code: u16, response: ureq::Response, pointer: &str) -> BackendError {
    let body = response.into_string().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value.pointer(pointer).and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    BackendError::Query(format!("http {code}: {message}"))
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SnowflakeCredentials {
    pub account: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

fn default_token_type() -> String {
    "OAUTH".to_string()
}

impl SnowflakeCredentials {
    /// # Errors
    /// Returns an error when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        load_json(path)
    }
}

/// Snowflake SQL API v2 client for one task instance.
pub struct SnowflakeBackend {
    instance_id: String,
    credentials: SnowflakeCredentials,
    agent: Option<ureq::Agent>,
}

impl SnowflakeBackend {
    #[must_use]
    pub fn new(instance_id: String, credentials: SnowflakeCredentials) -> Self {
        Self {
            instance_id,
            credentials,
            agent: None,
        }
    }

    fn base_url(&self) -> String {
        format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            self.credentials.account
        )
    }

    fn fetch(&mut self, query: &str, limits: &ExecutionLimits) -> Result<Fetch, BackendError> {
        let deadline = Instant::now() + limits.time_limit;
        let token = resolve_secret(
            self.credentials.token.as_ref(),
            self.credentials.token_env.as_ref(),
            "token",
        )?;
        let agent = self
            .agent
            .get_or_insert_with(|| {
                ureq::AgentBuilder::new()
                    .timeout(limits.time_limit)
                    .build()
            })
            .clone();

        let mut body = Map::new();
        body.insert("statement".to_string(), json!(query));
        body.insert("timeout".to_string(), json!(remaining_secs(deadline)));
        for (field, value) in [
            ("warehouse", &self.credentials.warehouse),
            ("database", &self.credentials.database),
            ("schema", &self.credentials.schema),
            ("role", &self.credentials.role),
        ] {
            if let Some(value) = value {
                body.insert(field.to_string(), json!(value));
            }
        }

        let authorize = |req: ureq::Request| {
            req.set("authorization", &format!("Bearer {token}"))
                .set(
                    "x-snowflake-authorization-token-type",
                    &self.credentials.token_type,
                )
                .set("accept", "application/json")
        };

        let response = authorize(agent.post(&self.base_url()))
            .send_json(Value::Object(body))
            .map_err(snowflake_error)?;
        let mut status = response.status();
        let mut payload: Value = response
            .into_json()
            .map_err(|err| BackendError::Protocol(err.to_string()))?;

        while status == 202 {
            if Instant::now() >= deadline {
                return Ok(Fetch::TimedOut);
            }
            let handle = payload
                .get("statementHandle")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Protocol("202 without statementHandle".into()))?
                .to_string();
            thread::sleep(STATUS_POLL_INTERVAL);
            debug!(instance = %self.instance_id, handle = %handle, "polling snowflake statement");
            let response = authorize(agent.get(&format!("{}/{handle}", self.base_url())))
                .call()
                .map_err(snowflake_error)?;
            status = response.status();
            payload = response
                .into_json()
                .map_err(|err| BackendError::Protocol(err.to_string()))?;
        }

        snowflake_table_from_response(&payload, limits.size_limit).map(Fetch::Done)
    }
}

fn snowflake_error(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(code, response) => status_error(code, response, "/message"),
        ureq::Error::Transport(err) => BackendError::Connection(err.to_string()),
    }
}

impl QueryBackend for SnowflakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Snowflake
    }

    fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        match self.fetch(query, limits) {
            Ok(Fetch::Done(fetched)) => materialize(fetched, destination, limits.size_limit),
            Ok(Fetch::TimedOut) => ExecutionOutcome::timeout(query),
            Err(err) => ExecutionOutcome::error(&err.to_string()),
        }
    }

    fn close(&mut self) {
        self.agent = None;
    }
}

/// Decode a Snowflake SQL API result set. Only the first partition is read; more partitions
/// mark the rows truncated.
///
/// # Errors
/// Returns an error when `resultSetMetaData.rowType` is missing.
pub fn snowflake_table_from_response(
    body: &Value,
    size_limit: usize,
) -> Result<FetchedRows, BackendError> {
    let row_type = body
        .pointer("/resultSetMetaData/rowType")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Protocol("missing resultSetMetaData.rowType".into()))?;
    let columns: Vec<String> = row_type
        .iter()
        .map(|column| {
            column
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    let kinds: Vec<ColumnKind> = row_type
        .iter()
        .map(|column| {
            let type_name = column.get("type").and_then(Value::as_str).unwrap_or("text");
            let scale = column.get("scale").and_then(Value::as_i64).unwrap_or(0);
            match type_name.to_ascii_lowercase().as_str() {
                "fixed" if scale == 0 => ColumnKind::Integer,
                "fixed" | "real" => ColumnKind::Real,
                _ => ColumnKind::Text,
            }
        })
        .collect();

    let mut accumulator = RowAccumulator::new(size_limit);
    if let Some(data) = body.get("data").and_then(Value::as_array) {
        for raw_row in data {
            let values = raw_row.as_array().map(Vec::as_slice).unwrap_or_default();
            let row = kinds
                .iter()
                .enumerate()
                .map(|(index, kind)| kind.cell(values.get(index).unwrap_or(&Value::Null)))
                .collect();
            if !accumulator.push(row) {
                break;
            }
        }
    }
    let mut fetched = accumulator.finish(columns);
    let partitions = body
        .pointer("/resultSetMetaData/partitionInfo")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    fetched.truncated |= partitions > 1;
    Ok(fetched)
}

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    fn cell(self, value: &Value) -> Cell {
        let text = match value {
            Value::Null => return Cell::Null,
            Value::String(text) => text.clone(),
            Value::Bool(_) | Value::Number(_) => value.to_string(),
            Value::Array(_) | Value::Object(_) => return Cell::Text(value.to_string()),
        };
        match self {
            Self::Integer => text
                .parse::<i64>()
                .map_or_else(|_| Cell::Text(text.clone()), Cell::Integer),
            Self::Real => text
                .parse::<f64>()
                .map_or_else(|_| Cell::Text(text.clone()), Cell::Real),
            Self::Text => Cell::Text(text),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BigQueryCredentials {
    pub project_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_token_env: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl BigQueryCredentials {
    /// # Errors
    /// Returns an error when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        load_json(path)
    }
}

/// `BigQuery` `jobs.query` client for one task instance.
pub struct BigQueryBackend {
    instance_id: String,
    credentials: BigQueryCredentials,
    agent: Option<ureq::Agent>,
}

impl BigQueryBackend {
    #[must_use]
    pub fn new(instance_id: String, credentials: BigQueryCredentials) -> Self {
        Self {
            instance_id,
            credentials,
            agent: None,
        }
    }

    fn base_url(&self) -> String {
        format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            self.credentials.project_id
        )
    }

    fn fetch(&mut self, query: &str, limits: &ExecutionLimits) -> Result<Fetch, BackendError> {
        let deadline = Instant::now() + limits.time_limit;
        let token = resolve_secret(
            self.credentials.access_token.as_ref(),
            self.credentials.access_token_env.as_ref(),
            "access_token",
        )?;
        let agent = self
            .agent
            .get_or_insert_with(|| {
                ureq::AgentBuilder::new()
                    .timeout(limits.time_limit)
                    .build()
            })
            .clone();
        let timeout_ms = remaining_secs(deadline) * 1_000;

        let mut body = json!({
            "query": query,
            "useLegacySql": false,
            "timeoutMs": timeout_ms,
        });
        if let Some(location) = &self.credentials.location {
            body["location"] = json!(location);
        }

        let bearer = format!("Bearer {token}");
        let mut payload: Value = agent
            .post(&self.base_url())
            .set("authorization", &bearer)
            .send_json(body)
            .map_err(bigquery_error)?
            .into_json()
            .map_err(|err| BackendError::Protocol(err.to_string()))?;

        while !payload
            .get("jobComplete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            if Instant::now() >= deadline {
                return Ok(Fetch::TimedOut);
            }
            let job_id = payload
                .pointer("/jobReference/jobId")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Protocol("incomplete job without jobId".into()))?
                .to_string();
            thread::sleep(STATUS_POLL_INTERVAL);
            debug!(instance = %self.instance_id, job = %job_id, "polling bigquery job");
            let mut request = agent
                .get(&format!("{}/{job_id}", self.base_url()))
                .set("authorization", &bearer)
                .query("timeoutMs", &(remaining_secs(deadline) * 1_000).to_string());
            if let Some(location) = &self.credentials.location {
                request = request.query("location", location);
            }
            payload = request
                .call()
                .map_err(bigquery_error)?
                .into_json()
                .map_err(|err| BackendError::Protocol(err.to_string()))?;
        }

        bigquery_table_from_response(&payload, limits.size_limit).map(Fetch::Done)
    }
}

fn bigquery_error(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(code, response) => status_error(code, response, "/error/message"),
        ureq::Error::Transport(err) => BackendError::Connection(err.to_string()),
    }
}

impl QueryBackend for BigQueryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BigQuery
    }

    fn execute(
        &mut self,
        query: &str,
        destination: Option<&Path>,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        match self.fetch(query, limits) {
            Ok(Fetch::Done(fetched)) => materialize(fetched, destination, limits.size_limit),
            Ok(Fetch::TimedOut) => ExecutionOutcome::timeout(query),
            Err(err) => ExecutionOutcome::error(&err.to_string()),
        }
    }

    fn close(&mut self) {
        self.agent = None;
    }
}

/// Decode a `jobs.query` / `getQueryResults` body. A `pageToken` means more rows exist upstream
/// and marks the rows truncated.
///
/// # Errors
/// Returns an error when `schema.fields` is missing.
pub fn bigquery_table_from_response(
    body: &Value,
    size_limit: usize,
) -> Result<FetchedRows, BackendError> {
    let fields = body
        .pointer("/schema/fields")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Protocol("missing schema.fields".into()))?;
    let columns: Vec<String> = fields
        .iter()
        .map(|field| {
            field
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    let kinds: Vec<ColumnKind> = fields
        .iter()
        .map(|field| {
            let repeated = field.get("mode").and_then(Value::as_str) == Some("REPEATED");
            match field.get("type").and_then(Value::as_str).unwrap_or("STRING") {
                _ if repeated => ColumnKind::Text,
                "INTEGER" | "INT64" => ColumnKind::Integer,
                "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => ColumnKind::Real,
                _ => ColumnKind::Text,
            }
        })
        .collect();

    let mut accumulator = RowAccumulator::new(size_limit);
    if let Some(rows) = body.get("rows").and_then(Value::as_array) {
        for raw_row in rows {
            let values = raw_row
                .get("f")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let row = kinds
                .iter()
                .enumerate()
                .map(|(index, kind)| {
                    let value = values
                        .get(index)
                        .and_then(|cell| cell.get("v"))
                        .unwrap_or(&Value::Null);
                    kind.cell(value)
                })
                .collect();
            if !accumulator.push(row) {
                break;
            }
        }
    }
    let mut fetched = accumulator.finish(columns);
    fetched.truncated |= body.get("pageToken").is_some();
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::{bigquery_table_from_response, snowflake_table_from_response, SnowflakeCredentials};
    use quorum_sql_domain::Cell;
    use serde_json::json;

    #[test]
    fn snowflake_result_set_is_typed_by_row_type() {
        let body = json!({
            "resultSetMetaData": {
                "numRows": 2,
                "rowType": [
                    {"name": "REGION", "type": "text"},
                    {"name": "ORDERS", "type": "fixed", "scale": 0},
                    {"name": "SHARE", "type": "fixed", "scale": 2}
                ],
                "partitionInfo": [{"rowCount": 2}]
            },
            "data": [["north", "12", "0.25"], ["south", null, "0.75"]]
        });
        let fetched = snowflake_table_from_response(&body, 30_000);
        assert!(fetched.is_ok());
        let fetched = fetched.unwrap_or_else(|_| unreachable!());
        assert_eq!(fetched.table.columns, vec!["REGION", "ORDERS", "SHARE"]);
        assert_eq!(
            fetched.table.rows[0],
            vec![Cell::Text("north".into()), Cell::Integer(12), Cell::Real(0.25)]
        );
        assert_eq!(fetched.table.rows[1][1], Cell::Null);
        assert!(!fetched.truncated);
    }

    #[test]
    fn snowflake_extra_partitions_mark_truncation() {
        let body = json!({
            "resultSetMetaData": {
                "rowType": [{"name": "X", "type": "text"}],
                "partitionInfo": [{"rowCount": 1}, {"rowCount": 5000}]
            },
            "data": [["a"]]
        });
        let fetched = snowflake_table_from_response(&body, 30_000).unwrap_or_else(|_| unreachable!());
        assert!(fetched.truncated);
        assert!(snowflake_table_from_response(&json!({"data": []}), 30_000).is_err());
    }

    #[test]
    fn bigquery_rows_are_decoded_from_f_v_cells() {
        let body = json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "name", "type": "STRING"},
                {"name": "n", "type": "INTEGER"},
                {"name": "avg", "type": "FLOAT"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"}
            ]},
            "rows": [
                {"f": [{"v": "a"}, {"v": "3"}, {"v": "1.5"}, {"v": [{"v": "x"}]}]},
                {"f": [{"v": null}, {"v": "4"}, {"v": "2.0"}, {"v": []}]}
            ],
            "pageToken": "next"
        });
        let fetched = bigquery_table_from_response(&body, 30_000);
        assert!(fetched.is_ok());
        let fetched = fetched.unwrap_or_else(|_| unreachable!());
        assert_eq!(fetched.table.rows[0][1], Cell::Integer(3));
        assert_eq!(fetched.table.rows[0][2], Cell::Real(1.5));
        assert_eq!(fetched.table.rows[0][3], Cell::Text("[{\"v\":\"x\"}]".into()));
        assert_eq!(fetched.table.rows[1][0], Cell::Null);
        assert!(fetched.truncated);
    }

    #[test]
    fn snowflake_credentials_default_token_type() {
        let credentials: SnowflakeCredentials =
            serde_json::from_value(json!({"account": "acme-xy12345", "token_env": "SF_TOKEN"}))
                .unwrap_or_else(|_| unreachable!());
        assert_eq!(credentials.token_type, "OAUTH");
        assert!(credentials.token.is_none());
    }
}
