use quorum_sql_domain::{hard_cut, BackendKind, TaskInstance};

pub const SINGLE_BLOCK_REMINDER: &str = "Please output only one SQL.";
pub const CORRECTION_REMINDER: &str = "Please generate only one SQL with thinking process.";
pub const SIMPLIFY_HINT: &str =
    "Since the output is empty, please simplify some conditions of the past sql.\n";
pub const CAST_HINT: &str =
    "Please remove \"\"\" in results. Use CAST: CAST(column_name AS STRING).\n";
pub const JUDGE_REMINDER: &str =
    "Please output the name of the chosen sql file in the format ```plaintext\nxxx.sql```. Do not omit 'plaintext'.";

/// Characters of a result table echoed back during self-consistency checks.
pub const CSV_EXCERPT_CHARS: usize = 500;

const DECIMAL_HINT: &str =
    "If the task does not specify decimal places, keep all decimals to four places.\n";
const KNOWLEDGE_HINT: &str =
    "Your knowledge comes from the information in the database. Do not rely on your own knowledge.\n";
const SYMBOL_HINT: &str =
    "In string matching, replace non-standard symbols with '%'. For example, turn he's into he%s.\n";

fn dialect_example(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Sqlite => {
            "```sql\nSELECT DISTINCT \"column_name\" FROM \"table_name\" WHERE ... ``` (replace \"table_name\" with the real table name; quote table and column names that contain special characters or match reserved words)"
        }
        BackendKind::Snowflake => {
            "```sql\nSELECT \"COLUMN_NAME\" FROM DATABASE.SCHEMA.TABLE WHERE ... ``` (adjust DATABASE, SCHEMA and TABLE to the real names and keep every column name in double quotes)"
        }
        BackendKind::BigQuery => {
            "```sql\nSELECT `column_name` FROM `database.schema.table` WHERE ... ``` (replace database, schema and table with the real names and wrap identifiers in backticks)"
        }
    }
}

fn union_hint(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Sqlite => "",
        BackendKind::Snowflake => {
            "When running UNION over several tables, list every table name explicitly. Union first, then add conditions and projections. Never abbreviate the table list with comments such as '-- Include all' or '-- ...'.\n"
        }
        BackendKind::BigQuery => {
            "When running UNION over tables sharing a prefix, a wildcard table keeps the query short: SELECT col1 FROM `project.dataset.prefix*` WHERE _TABLE_SUFFIX IN ('a', 'b');\n"
        }
    }
}

fn nested_hint(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Sqlite => {
            "To read a key from a nested JSON column: SELECT t.\"column_name\", json_extract(f.value, '$.key_name') AS \"abstract_text\" FROM \"table_name\" AS t, json_each(t.\"json_column_name\") AS f;\nIf the structure of a nested column such as event_params is unknown, inspect the whole column first: SELECT f.value FROM \"table_name\" AS t, json_each(t.\"event_params\") AS f;\n"
        }
        BackendKind::Snowflake => {
            "For JSON nested columns: SELECT t.\"column_name\", f.value::VARIANT:\"key_name\"::STRING AS \"abstract_text\" FROM DATABASE.SCHEMA.TABLE t, LATERAL FLATTEN(input => t.\"json_column_name\") f; If the structure of a nested column such as event_params is unknown, inspect the whole column first: SELECT f.value FROM table t, LATERAL FLATTEN(input => t.\"event_params\") f;\n"
        }
        BackendKind::BigQuery => {
            "To read a key from a nested JSON column: SELECT t.`column_name`, JSON_EXTRACT_SCALAR(f.value, \"$.key_name\") AS `abstract_text` FROM `database.schema.table` AS t, UNNEST(JSON_EXTRACT_ARRAY(t.`json_column_name`)) AS f;\nIf the structure of a nested column such as event_params is unknown, inspect the whole column first: SELECT f.value FROM `project.dataset.table` AS t, UNNEST(JSON_EXTRACT_ARRAY(t.`event_params`)) AS f;\n"
        }
    }
}

fn string_matching_hint(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Sqlite => {
            "Do not match strings exactly unless you are sure of them. For fuzzy matching use WHERE str LIKE '%target_str%'; to match 'meat lovers' use WHERE str LIKE '%meat%lovers%'. Add COLLATE BINARY when case matters.\n"
        }
        BackendKind::Snowflake => {
            "Do not match strings exactly unless you are sure of them. Start with a fuzzy query: WHERE str ILIKE '%target_str%'. Replace spaces with %, e.g. ILIKE '%meat%lovers%'.\n"
        }
        BackendKind::BigQuery => {
            "Do not match strings exactly unless you are sure of them. Use LOWER for fuzzy queries: WHERE LOWER(str) LIKE LOWER('%target_str%'), e.g. LOWER(str) LIKE '%meat%lovers%'.\n"
        }
    }
}

/// The first request of an attempt: schema, exploration notes, question and dialect guidance.
#[must_use]
pub fn generation_prompt(
    task: &TaskInstance,
    schema: &str,
    kind: BackendKind,
    answer_format: Option<&str>,
    exploration: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if !schema.is_empty() {
        prompt.push_str(schema);
        prompt.push('\n');
    }
    if let Some(notes) = exploration.filter(|notes| !notes.is_empty()) {
        prompt.push_str("Some few-shot examples after column exploration may be helpful:\n");
        prompt.push_str(notes);
        prompt.push('\n');
    }
    prompt.push_str(&format!("Task: {}\n", task.question));
    prompt.push_str(&format!(
        "\nThink step by step and answer with exactly one complete SQL query in the {} dialect inside a ```sql``` block.\n",
        kind.dialect()
    ));
    prompt.push_str(&format!("SQL usage example: {}\n", dialect_example(kind)));
    if let Some(answer_format) = answer_format {
        prompt.push_str(&format!("Follow this answer format: {answer_format}.\n"));
    }
    prompt.push_str("Useful tips for answering:\n");
    prompt.push_str(union_hint(kind));
    if kind == BackendKind::Snowflake {
        prompt.push_str("When using ORDER BY xxx DESC, add NULLS LAST to exclude null records.\n");
    }
    prompt.push_str(
        "When the task asks for entities without naming ids or names, return both. For example, a question about which products ... should return product_name and product_id.\n",
    );
    prompt.push_str(
        "When asked for a percentage decrease, return a positive value. Try ABS().\n",
    );
    prompt.push_str(DECIMAL_HINT);
    prompt
}

/// Ask for a fix of `query`, quoting the error exactly as the backend reported it.
#[must_use]
pub fn correction_prompt(query: &str, error: &str, simplify: bool) -> String {
    let mut prompt = format!(
        "Input SQL:\n{query}\nError info:\n{error}\nFix it based on the previous context and output only one SQL query with your thinking process in the format ```sql\n--Description: \n```. Do not output analysis without SQL and do not output several SQLs.\n"
    );
    if simplify {
        prompt.push_str(SIMPLIFY_HINT);
    }
    prompt
}

/// Re-ask with the current answer on the table so the generator either confirms or revises it.
#[must_use]
pub fn self_consistency_prompt(
    task: &TaskInstance,
    answer_format: Option<&str>,
    csv_text: &str,
    query: &str,
) -> String {
    let mut prompt = format!(
        "Please check the answer again by reviewing the task:\n {}\n, review the relevant tables, columns and possible conditions, then give the final SQL query. Do not output other queries. If you think the answer is right, output the current SQL unchanged.\n",
        task.question
    );
    prompt.push_str(DECIMAL_HINT);
    if let Some(answer_format) = answer_format {
        prompt.push_str(&format!("The answer format should be like: {answer_format}\n"));
    }
    prompt.push_str("Current answer: \n");
    prompt.push_str(&hard_cut(csv_text, CSV_EXCERPT_CHARS).0);
    prompt.push_str(&format!("Current SQL:\n{query}"));
    prompt
}

/// Ask for a batch of small queries that show what the relevant columns hold.
#[must_use]
pub fn exploration_prompt(
    task: &TaskInstance,
    schema: &str,
    kind: BackendKind,
    max_queries: usize,
) -> String {
    let mut prompt = String::new();
    if !schema.is_empty() {
        prompt.push_str(schema);
        prompt.push('\n');
    }
    prompt.push_str(&format!("Task: {}\n", task.question));
    prompt.push_str(&format!(
        "Write at most {max_queries} {} SQL queries, from simple to complex, in the format {} inside ```sql``` code blocks, to understand the values of the related columns.\n",
        kind.dialect(),
        dialect_example(kind)
    ));
    prompt.push_str(
        "Each query must be different. Do not query the schema or data types. Only SELECT queries are allowed. Try DISTINCT. Limit each SQL to 20 rows.\n",
    );
    prompt.push_str("Describe each SQL in the format ```sql\n--Description: \n```.\n");
    prompt.push_str(nested_hint(kind));
    prompt.push_str(SYMBOL_HINT);
    prompt.push_str(string_matching_hint(kind));
    prompt.push_str(
        "Time values come in many formats, so avoid time conversion functions unless you are sure of the format.\n",
    );
    prompt.push_str(
        "Take care with quote matching, e.g. 'Vegetarian\" mixes ' and \" and fails.\n",
    );
    prompt.push_str(KNOWLEDGE_HINT);
    prompt
}

/// After one exploratory query was repaired, ask for the same repair across the rest.
#[must_use]
pub fn exploration_followup_prompt(failed: &str, corrected: &str, remaining: &[String]) -> String {
    format!(
        "```sql\n{failed}``` was corrected to ```sql\n{corrected}```. Please correct the other SQLs with similar errors. SQLs: {remaining:?}. Answer each SQL in the format ```sql\n--Description: \n```.\n"
    )
}

/// Ask for the header of the expected answer table without any SQL.
#[must_use]
pub fn answer_format_prompt(task: &TaskInstance) -> String {
    let mut prompt = format!("Task: {}", task.question);
    prompt.push_str(
        "This is a SQL task. Please provide the simplest possible answer format in ```csv``` format like a table.\n",
    );
    prompt.push_str(
        "E.g.1. Include the travel coordinates and the cumulative travel distance at each point. Format: ```csv\ntravel_coordinates,cumulative_travel_distance\nPOINT(longitude1 latitude1),distance1:int\nPOINT(longitude2 latitude2),distance2:int\n...```\n",
    );
    prompt.push_str(
        "When the task asks for entities without naming ids or names, provide both. E.g.2. Which products kept a seasonally adjusted sales ratio of at least 2 in every month of 2017? Format: ```csv\nproduct_name,product_id\nproduct_name1:str,product_id1:int\n...```\n",
    );
    prompt.push_str("Do not output any SQL queries.\n");
    prompt
}

#[must_use]
pub fn flatten_hint(values: &[String]) -> String {
    format!(
        "Values {values:?} are nested. Please flatten them, e.g. turn '[\\nA,\\n B\\n]' into 'A, B'.\n"
    )
}

#[must_use]
pub fn degenerate_hint(columns: &[String]) -> String {
    format!("Empty results in Column {columns:?}. Please correct them.\n")
}

/// One tied answer as a judge sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeOption {
    pub sql_name: String,
    pub sql: String,
    pub csv_name: String,
    pub csv_excerpt: String,
}

#[must_use]
pub fn judge_prompt(task: &TaskInstance, schema: &str, options: &[JudgeOption]) -> String {
    let mut prompt = format!(
        "You are given database information, a task, and candidate SQLs with their results. Choose the most correct one based on the database information:\n{schema}. Task: {}. Here are the candidate SQLs and answers: \n",
        task.question
    );
    for option in options {
        prompt.push_str(&format!("SQL file name: {}\n", option.sql_name));
        prompt.push_str(&option.sql);
        prompt.push('\n');
        prompt.push_str(&format!("CSV file name: {}\n", option.csv_name));
        prompt.push_str(&option.csv_excerpt);
        prompt.push('\n');
    }
    prompt.push_str(
        "Compare the SQL and results of each answer, think step by step, and choose one SQL as the correct answer. Output the sql file name with your reasoning in the format ```plaintext\nxxx.sql```. Do not omit 'plaintext'.\n",
    );
    prompt.push_str("Results containing null or 0 values are likely wrong.\n");
    prompt.push_str(
        "Reason in these steps: 1. Exclude unreasonable results. 2. Check that the results match the task. 3. Check that the SQL matches the task.\n",
    );
    prompt
}
