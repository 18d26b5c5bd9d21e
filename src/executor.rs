use crate::error::CoreError;

use log::{debug, warn};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the financial statements live.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Name the database is attached under, so `"ADMIN"."MCD_INCOME_QUARTERLY"` resolves.
    pub schema_alias: Option<String>,
}

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("None"),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(t) => f.write_str(t),
            SqlValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// The rows and column names a query produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSet {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Outcome of one execution attempt. Database errors land in `error_message`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub rows: Option<Vec<Vec<SqlValue>>>,
    pub column_names: Vec<String>,
    pub elapsed: Duration,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }

    /// First cell of the first row, or `No data found`.
    pub fn formatted_scalar(&self) -> String {
        self.rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.first())
            .map(|cell| cell.to_string())
            .unwrap_or_else(|| "No data found".to_string())
    }

    fn failed(message: String, elapsed: Duration) -> Self {
        Self {
            rows: None,
            column_names: Vec::new(),
            elapsed,
            error_message: Some(message),
        }
    }
}

/// An open database session. Dropping it releases the connection.
pub trait SqlSession {
    fn query(&mut self, sql: &str) -> Result<RowSet, CoreError>;
}

/// Opens sessions. Every `open` must return a fresh, independent session.
pub trait SqlConnector: Send + Sync {
    fn open(&self) -> Result<Box<dyn SqlSession + '_>, CoreError>;
}

/// SQLite-backed connector for the financial statements database.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    config: DatabaseConfig,
}

impl SqliteConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

struct SqliteSession {
    conn: Connection,
}

impl SqlSession for SqliteSession {
    fn query(&mut self, sql: &str) -> Result<RowSet, CoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = column_names.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            rows.push(values);
        }
        Ok(RowSet { column_names, rows })
    }
}

impl SqlConnector for SqliteConnector {
    fn open(&self) -> Result<Box<dyn SqlSession + '_>, CoreError> {
        if !self.config.path.is_file() {
            return Err(CoreError::Config(format!(
                "Database not found at {}",
                self.config.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &self.config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        if let Some(alias) = &self.config.schema_alias {
            let path = self.config.path.to_string_lossy().into_owned();
            conn.execute("ATTACH DATABASE ?1 AS ?2", params![path, alias])?;
        }
        register_functions(&conn)?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

/// Oracle's `LEAST` and `GREATEST`, which generated queries lean on.
fn register_functions(conn: &Connection) -> Result<(), CoreError> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    for (name, pick_greatest) in [("LEAST", false), ("GREATEST", true)] {
        conn.create_scalar_function(name, -1, flags, move |ctx| {
            let mut best: Option<(f64, Value)> = None;
            for i in 0..ctx.len() {
                let value: Value = ctx.get(i)?;
                let number = match value {
                    Value::Null => return Ok(Value::Null),
                    Value::Integer(n) => n as f64,
                    Value::Real(r) => r,
                    _ => continue,
                };
                let replace = match &best {
                    None => true,
                    Some((current, _)) if pick_greatest => number > *current,
                    Some((current, _)) => number < *current,
                };
                if replace {
                    best = Some((number, value));
                }
            }
            Ok(best.map(|(_, value)| value).unwrap_or(Value::Null))
        })?;
    }
    Ok(())
}

/// Drops a single trailing statement terminator, which the driver rejects.
pub fn strip_terminator(sql: &str) -> &str {
    let trimmed = sql.trim();
    trimmed.strip_suffix(';').map(str::trim_end).unwrap_or(trimmed)
}

/// Runs candidate queries. Never returns an error: failures are part of the result.
pub struct SqlExecutor {
    connector: Arc<dyn SqlConnector>,
}

impl SqlExecutor {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector }
    }

    pub fn execute(&self, sql: &str) -> ExecutionResult {
        let start = Instant::now();
        let statement = strip_terminator(sql);
        debug!("Executing SQL: {}", statement);

        let outcome = self
            .connector
            .open()
            .and_then(|mut session| session.query(statement));

        let elapsed = start.elapsed();
        match outcome {
            Ok(set) => {
                debug!("Query returned {} rows in {:?}", set.rows.len(), elapsed);
                ExecutionResult {
                    rows: Some(set.rows),
                    column_names: set.column_names,
                    elapsed,
                    error_message: None,
                }
            }
            Err(e) => {
                let message = match e {
                    CoreError::Sqlite(inner) => inner.to_string(),
                    other => other.to_string(),
                };
                warn!("Database error: {}", message);
                ExecutionResult::failed(message, elapsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_exactly_one_terminator() {
        assert_eq!(strip_terminator("SELECT 1;"), "SELECT 1");
        assert_eq!(strip_terminator("  SELECT 1 ;  "), "SELECT 1");
        assert_eq!(strip_terminator("SELECT 1;;"), "SELECT 1;");
        assert_eq!(strip_terminator("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn formatted_scalar_falls_back_when_empty() {
        let empty = ExecutionResult {
            rows: Some(vec![]),
            column_names: vec!["Q3_2024".to_string()],
            elapsed: Duration::ZERO,
            error_message: None,
        };
        assert_eq!(empty.formatted_scalar(), "No data found");

        let one = ExecutionResult {
            rows: Some(vec![vec![SqlValue::Real(6872.0)]]),
            ..empty
        };
        assert_eq!(one.formatted_scalar(), "6872");
    }

    #[test]
    fn least_and_greatest_are_available() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        let (least, greatest): (f64, i64) = conn
            .query_row("SELECT LEAST(3, 1.5, 2), GREATEST(3, 1, 2)", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(least, 1.5);
        assert_eq!(greatest, 3);
        let null: Option<i64> = conn.query_row("SELECT GREATEST(1, NULL)", [], |r| r.get(0)).unwrap();
        assert_eq!(null, None);
    }
}
