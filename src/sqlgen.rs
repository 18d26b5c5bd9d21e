//! Text-to-SQL generation over a company's statement tables.

use crate::datam::{SamplingParams, Usage};
use crate::error::CoreError;
use crate::orchestra::Orchestra;
use crate::schema::SchemaDescriptor;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

/// Near-deterministic sampling for SQL.
pub const SQL_SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.3,
    max_tokens: 1024,
};

pub const DEFAULT_NOTES: &str = "No additional notes.";
const EMPTY_COMPLETION_NOTES: &str = "LLM did not return any response.";

static SQL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)SQL:\s*(.*?)(?:\nNOTE:|\z)").expect("SQL marker pattern is valid"));
static NOTE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)NOTE:\s*(.*)").expect("NOTE marker pattern is valid"));
static FENCE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*```[ \t]*(?i:sql)?\s*").expect("fence pattern is valid"));
static FENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*```\s*$").expect("fence pattern is valid"));

const OUTPUT_RULES: &str = r#"### Output format:
The SQL query should ALWAYS start with "SQL:". For example "SQL:SELECT * FROM TABLE;".
If you could not generate the SQL query, ONLY reply with "NOTE: [issue with creating the query].".
ALWAYS use "" (double quotes) for table and column names.
ALWAYS use ''(single quotes) for filtering "METRICS" column.
ALWAYS prefix "ADMIN" to table names.
ALWAYS MAKE SURE THE SQL SYNTAX IS CORRECT."#;

/// (question, query) pairs showing the statement-table conventions.
const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "What was McDonald's revenue in Q3 2024?",
        r#"SELECT "Q3_2024" FROM "ADMIN"."MCD_INCOME_QUARTERLY" WHERE "METRICS" = 'Revenue';"#,
    ),
    (
        "How much gross profit did Coca-Cola report in 2023?",
        r#"SELECT ("Q1_2023" + "Q2_2023" + "Q3_2023" + "Q4_2023") FROM "ADMIN"."KO_INCOME_QUARTERLY" WHERE METRICS = 'Gross Profit';"#,
    ),
    (
        "What was the change in operating expenses from first quarter of 2024 to the second quarter for meta?",
        r#"SELECT ("Q2_2024" - "Q1_2024") FROM "ADMIN"."META_INCOME_QUARTERLY" WHERE "METRICS" = 'Operating Expenses';"#,
    ),
    (
        "What's the ratio of quarter 3 2024 and q2 2024 for Meta's cash and equivalents?",
        r#"SELECT ("Q3_2024"/"Q2_2024") FROM "ADMIN"."META_BALANCE_SHEET_QUARTERLY" WHERE "METRICS" = 'Cash and Equivalents'"#,
    ),
    (
        "What is the ratio of Accounts Receivable to Total Current Assets in Q3 2024 for AMD?",
        r#"SELECT ar."Q3_2024" * 1.0 / tca."Q3_2024" AS ratio FROM "ADMIN"."AMD_BALANCE_SHEET_QUARTERLY" ar JOIN "ADMIN"."AMD_BALANCE_SHEET_QUARTERLY" tca ON ar."METRICS" = 'Accounts Receivable' AND tca."METRICS" = 'Total Current Assets';"#,
    ),
    (
        "What was the average Book Value Per Share for the first three quarters of 2024 for Amazon?",
        r#"SELECT ("Q1_2024"+"Q2_2024"+"Q3_2024")/3 FROM "ADMIN"."AMZN_BALANCE_SHEET_QUARTERLY" where "METRICS" = 'Book Value Per Share'"#,
    ),
    (
        "What was the percentage change in Cash and Equivalents from Q2 2024 to Q3 2024 for amazon?",
        r#"SELECT ("Q3_2024"- "Q2_2024")/"Q2_2024" * 100 FROM "ADMIN"."AMZN_BALANCE_SHEET_QUARTERLY" WHERE "METRICS" = 'Cash and Equivalents'"#,
    ),
    (
        "Give me the minimum value of Accounts Receivable in 2023 for Meta?",
        r#"SELECT LEAST("Q1_2023", "Q2_2023", "Q3_2023", "Q4_2023") FROM "ADMIN"."META_BALANCE_SHEET_QUARTERLY" WHERE "METRICS" = 'Accounts Receivable'"#,
    ),
    (
        "Provide me with the maximum value of Accounts Receivable in 2023 for Meta?",
        r#"SELECT GREATEST("Q1_2023", "Q2_2023", "Q3_2023", "Q4_2023") FROM "ADMIN"."META_BALANCE_SHEET_QUARTERLY" WHERE "METRICS" = 'Accounts Receivable'"#,
    ),
    (
        "What's the year-over-year change in Retained Earnings from Q3 2023 to Q3 2024 for AMD?",
        r#"SELECT ("Q3_2024" - "Q3_2023") FROM "ADMIN"."AMD_BALANCE_SHEET_QUARTERLY" WHERE "METRICS" = 'Retained Earnings';"#,
    ),
    (
        "How did the EPS Growth in Q3 2024 compare to Q3 2023 for Amazon?",
        r#"SELECT ("Q3_2024" - "Q3_2023") FROM "ADMIN"."AMZN_INCOME_QUARTERLY" WHERE "METRICS" = 'EPS Growth';"#,
    ),
];

/// One candidate query and whatever the model said about it.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuery {
    pub sql: Option<String>,
    pub notes: String,
    pub source_model: String,
    /// 1 for the first generation, incremented by each repair.
    pub attempt_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Builds the generation prompt: output rules, worked examples, then DDL and question.
pub fn build_prompt(question: &str, ddl: &str) -> String {
    let mut prompt = String::with_capacity(ddl.len() + 4096);
    prompt.push_str(OUTPUT_RULES);
    prompt.push_str("\n\n### Examples:\n");
    for (example_question, example_sql) in FEW_SHOT_EXAMPLES {
        prompt.push_str(&format!(
            "User input: {}\nYour SQL output: {}\n\n",
            example_question, example_sql
        ));
    }
    prompt.push_str(&format!(
        "### System instructions:\nYou generate SQL queries based on natural language questions.\n\
         Based on the DDL below, generate an SQL query.\n\n\
         ## ddl = \"\"\"{}\"\"\"\n\n\
         ## Natural Language Query\nquery = \"{}\"\n",
        ddl, question
    ));
    prompt
}

/// The request placed in the question slot when asking for a corrected query.
pub fn build_repair_request(failed_sql: &str, db_error: &str, ddl: &str) -> String {
    format!(
        "Fix the following SQL query which resulted in an error using the DDL.\n\
         Error message:{}\nQuery: {}\nDDL: {}",
        db_error, failed_sql, ddl
    )
}

/// Removes a markdown fence around a statement, if present.
fn strip_code_fence(statement: &str) -> String {
    let opened = FENCE_START.replace(statement, "");
    FENCE_END.replace(&opened, "").trim().to_string()
}

/// Splits a completion into its `SQL:` statement and its `NOTE:` text.
///
/// An empty statement counts as absent. Missing notes become `No additional notes.`
pub fn parse_completion(text: &str) -> (Option<String>, String) {
    let text = text.trim();
    if text.is_empty() {
        return (None, EMPTY_COMPLETION_NOTES.to_string());
    }
    let sql = SQL_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_code_fence(m.as_str()))
        // A bare "SQL:" line followed by a note would otherwise capture the note.
        .filter(|s| !s.is_empty() && !s.starts_with("NOTE:"));
    let notes = NOTE_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| DEFAULT_NOTES.to_string());
    (sql, notes)
}

pub struct SqlGenerator {
    orchestra: Arc<Orchestra>,
}

impl SqlGenerator {
    pub fn new(orchestra: Arc<Orchestra>) -> Self {
        Self { orchestra }
    }

    pub fn model_name(&self) -> &str {
        &self.orchestra.user_facing_model_name
    }

    /// Asks the model for a query answering `question` against `schema`.
    pub fn generate(
        &self,
        question: &str,
        schema: &SchemaDescriptor,
        api_key: &str,
    ) -> Result<GeneratedQuery, CoreError> {
        self.run_prompt(&build_prompt(question, &schema.ddl), api_key, 1)
    }

    /// Asks the model to fix `failed_sql` given the database's complaint.
    pub fn repair(
        &self,
        failed_sql: &str,
        db_error: &str,
        schema: &SchemaDescriptor,
        api_key: &str,
        attempt_number: u32,
    ) -> Result<GeneratedQuery, CoreError> {
        let request = build_repair_request(failed_sql, db_error, &schema.ddl);
        self.run_prompt(&build_prompt(&request, &schema.ddl), api_key, attempt_number)
    }

    fn run_prompt(
        &self,
        prompt: &str,
        api_key: &str,
        attempt_number: u32,
    ) -> Result<GeneratedQuery, CoreError> {
        let completion = self.orchestra.complete(prompt, api_key, SQL_SAMPLING)?;
        let (sql, notes) = parse_completion(&completion.text);
        debug!("Extracted SQL Query: {:?}", sql);
        debug!("Extracted Notes: {}", notes);
        Ok(GeneratedQuery {
            sql,
            notes,
            source_model: self.orchestra.user_facing_model_name.clone(),
            attempt_number,
            usage: completion.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statement_and_note() {
        let (sql, notes) = parse_completion("SQL: SELECT 1;\nNOTE: none");
        assert_eq!(sql.as_deref(), Some("SELECT 1;"));
        assert_eq!(notes, "none");
    }

    #[test]
    fn missing_marker_means_no_sql() {
        let (sql, notes) = parse_completion("NOTE: the DDL has no revenue column.");
        assert_eq!(sql, None);
        assert_eq!(notes, "the DDL has no revenue column.");

        let (sql, notes) = parse_completion("I cannot help with that");
        assert_eq!(sql, None);
        assert_eq!(notes, DEFAULT_NOTES);
    }

    #[test]
    fn statement_runs_to_end_without_note() {
        let (sql, notes) = parse_completion(
            "SQL:SELECT \"Q3_2024\"\nFROM \"ADMIN\".\"MCD_INCOME_QUARTERLY\";",
        );
        assert_eq!(
            sql.as_deref(),
            Some("SELECT \"Q3_2024\"\nFROM \"ADMIN\".\"MCD_INCOME_QUARTERLY\";")
        );
        assert_eq!(notes, DEFAULT_NOTES);
    }

    #[test]
    fn code_fences_are_removed() {
        let (sql, _) = parse_completion("SQL: ```sql\nSELECT 2;\n```");
        assert_eq!(sql.as_deref(), Some("SELECT 2;"));
    }

    #[test]
    fn blank_statement_counts_as_absent() {
        let (sql, _) = parse_completion("SQL:   \nNOTE: gave up");
        assert_eq!(sql, None);
        assert_eq!(parse_completion("   ").1, EMPTY_COMPLETION_NOTES);
    }

    #[test]
    fn prompt_carries_ddl_question_and_examples() {
        let prompt = build_prompt("What was revenue?", "CREATE TABLE \"MCD_INCOME_QUARTERLY\" (...)");
        assert!(prompt.starts_with("### Output format:"));
        assert!(prompt.contains("## ddl = \"\"\"CREATE TABLE \"MCD_INCOME_QUARTERLY\" (...)\"\"\""));
        assert!(prompt.contains("query = \"What was revenue?\""));
        assert_eq!(prompt.matches("User input:").count(), FEW_SHOT_EXAMPLES.len());
    }
}
