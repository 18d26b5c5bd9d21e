use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// The primary error type for the `finqa-core` library.
///
/// Every failure the pipeline can surface is one of these variants, so callers
/// branch on `kind()` instead of inspecting message text.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The company context did not match any known schema mapping.
    #[error("Company not recognized: {0}")]
    CompanyNotRecognized(String),

    /// The company resolved to a prefix, but its DDL file does not exist.
    #[error("DDL not found for company prefix '{prefix}' ({})", .path.display())]
    SchemaFileMissing { prefix: String, path: PathBuf },

    /// The provider kept rate-limiting until the retry ceiling was reached.
    #[error("LLM rate limit persisted after {attempts} attempts")]
    LlmRateLimited { attempts: u32 },

    /// A non rate-limit provider failure (network, auth, 5xx, bad payload).
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// The completion carried no `SQL:` statement.
    #[error("Failed to extract SQL query from LLM response: {notes}")]
    SqlParseFailure { notes: String },

    /// The last repair attempt still failed against the database.
    #[error("SQL execution failed after {attempts} attempts: {message}")]
    SqlExecution { message: String, attempts: u32 },

    /// The repair loop was driven through a transition its table does not allow.
    #[error("Illegal repair transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: crate::repair::RepairState,
        event: crate::repair::RepairEvent,
    },

    /// The vector index could not be opened or has not been built.
    #[error("Vector store not available: {0}")]
    IndexUnavailable(String),

    /// The index was reachable but the search itself failed.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Missing or malformed configuration, such as an unknown model name.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The classifier artifacts could not be loaded or are inconsistent.
    #[error("Classifier artifact error: {0}")]
    Artifact(String),

    /// A provider response body did not have the expected shape.
    #[error("Response parse error: {0}")]
    ResponseParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Vector index error: {0}")]
    Heed(#[from] heed::Error),

    #[error("Vector search error: {0}")]
    Arroy(#[from] arroy::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

/// The explicit category of a `CoreError`, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CompanyNotRecognized,
    SchemaFileMissing,
    LlmRateLimited,
    LlmUnavailable,
    SqlParseFailure,
    SqlExecutionError,
    IndexUnavailable,
    RetrievalError,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::CompanyNotRecognized(_) => ErrorKind::CompanyNotRecognized,
            CoreError::SchemaFileMissing { .. } => ErrorKind::SchemaFileMissing,
            CoreError::LlmRateLimited { .. } => ErrorKind::LlmRateLimited,
            CoreError::LlmUnavailable(_) | CoreError::Request(_) => ErrorKind::LlmUnavailable,
            CoreError::SqlParseFailure { .. } => ErrorKind::SqlParseFailure,
            CoreError::SqlExecution { .. } => ErrorKind::SqlExecutionError,
            CoreError::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            CoreError::Retrieval(_) | CoreError::Heed(_) | CoreError::Arroy(_) => {
                ErrorKind::RetrievalError
            }
            CoreError::Config(_)
            | CoreError::Artifact(_)
            | CoreError::ResponseParse(_)
            | CoreError::InvalidTransition { .. }
            | CoreError::Io(_)
            | CoreError::Sqlite(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-equivalent status for hosts that expose the core over HTTP.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::CompanyNotRecognized | ErrorKind::SchemaFileMissing => 404,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::ResponseParse(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<CoreError> for pyo3::PyErr {
    fn from(err: CoreError) -> pyo3::PyErr {
        pyo3::exceptions::PyValueError::new_err(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
