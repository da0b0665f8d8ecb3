//! Error types for the execution boundary.

use std::time::Duration;

use carquery_sql::ReasonCode;
use thiserror::Error;

/// Execution result type.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// SQLSTATE codes Postgres uses for an undefined table or column.
const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";

/// Failures while executing an accepted statement.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The statement names a table or column the live database lacks.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The statement did not finish within the configured timeout.
    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    /// The engine refused the candidate, so nothing was run.
    #[error("Rejected ({reason}): {message}")]
    Rejected { reason: ReasonCode, message: String },

    /// Database file does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl ExecutionError {
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<sqlx::Error> for ExecutionError {
    fn from(err: sqlx::Error) -> Self {
        let mismatch = match &err {
            sqlx::Error::Database(db) => {
                let by_code = db
                    .code()
                    .is_some_and(|c| c == UNDEFINED_TABLE || c == UNDEFINED_COLUMN);
                let lower = db.message().to_ascii_lowercase();
                (by_code || lower.contains("no such table") || lower.contains("no such column"))
                    .then(|| db.message().to_string())
            }
            sqlx::Error::ColumnNotFound(name) => Some(format!("no such column: {}", name)),
            _ => None,
        };
        match mismatch {
            Some(message) => Self::SchemaMismatch(message),
            None => Self::Other(err),
        }
    }
}
