//! Read-only execution of repaired inventory SQL.
//!
//! Only statements the repair engine accepts should reach this crate.
//! [`InventoryDb::execute_validated`] enforces that by running the engine
//! first; [`InventoryDb::execute`] trusts its caller.

pub mod error;

use std::path::Path;
use std::time::Duration;

use carquery_sql::{CastStyle, Outcome, RepairPipeline, SchemaCatalog};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use tracing::{debug, info};

pub use error::{ExecutionError, Result};

/// Default upper bound on a single statement's runtime.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows, column names and the untruncated row count of one statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    /// The statement that was executed.
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_count: usize,
    /// True when `rows` holds fewer rows than `total_count`.
    pub truncated: bool,
}

/// Handle to the inventory database.
pub struct InventoryDb {
    pool: SqlitePool,
    statement_timeout: Duration,
}

impl InventoryDb {
    /// Open an existing database file read-only.
    pub async fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExecutionError::not_found(format!(
                "Database not found: {}",
                path.display()
            )));
        }
        let url = format!("sqlite:{}?mode=ro", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await?;
        info!(path = %path.display(), "opened inventory database read-only");
        Ok(Self::from_pool(pool))
    }

    /// Open a writable in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Run `sql` and return at most `row_cap` rows plus the full row count.
    pub async fn execute(&self, sql: &str, row_cap: usize) -> Result<QueryOutput> {
        let sql = sql.trim().trim_end_matches(';').trim_end();
        let columns = self.bounded(self.column_names(sql)).await?;

        let count_sql = format!("SELECT COUNT(*) FROM ({}) AS _q", sql);
        let total: i64 = self
            .bounded(async {
                let row = sqlx::query(&count_sql).fetch_one(&self.pool).await?;
                Ok::<_, ExecutionError>(row.try_get::<i64, _>(0)?)
            })
            .await?;
        let total_count = usize::try_from(total).unwrap_or_default();

        let rows_sql = format!("SELECT * FROM ({}) AS _q LIMIT {}", sql, row_cap);
        let raw_rows = self
            .bounded(async {
                let rows = sqlx::query(&rows_sql).fetch_all(&self.pool).await?;
                Ok::<_, ExecutionError>(rows)
            })
            .await?;
        let rows = raw_rows
            .iter()
            .map(row_values)
            .collect::<Result<Vec<_>>>()?;

        let truncated = rows.len() < total_count;
        debug!(
            returned = rows.len(),
            total_count,
            truncated,
            "executed statement"
        );
        Ok(QueryOutput {
            sql: sql.to_string(),
            columns,
            rows,
            total_count,
            truncated,
        })
    }

    /// Repair `candidate` against `catalog` and execute it only when accepted.
    pub async fn execute_validated(
        &self,
        candidate: &str,
        catalog: &SchemaCatalog,
        style: &CastStyle,
        row_cap: usize,
    ) -> Result<QueryOutput> {
        let report = RepairPipeline::new(catalog)
            .with_cast_style(style.clone())
            .run(candidate);
        match report.outcome {
            Outcome::Accepted { sql } => self.execute(&sql, row_cap).await,
            Outcome::Rejected {
                reason, message, ..
            } => Err(ExecutionError::Rejected { reason, message }),
        }
    }

    async fn column_names(&self, sql: &str) -> Result<Vec<String>> {
        let statement = (&self.pool).prepare(sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect())
    }

    async fn bounded<T>(&self, work: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.statement_timeout, work)
            .await
            .map_err(|_| ExecutionError::Timeout(self.statement_timeout))?
    }
}

fn row_values(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len())
        .map(|idx| -> Result<Value> {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let kind = raw.type_info().name().to_string();
            let value = match kind.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => Value::from(row.try_get::<f64, _>(idx)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(idx)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get::<String, _>(idx)?),
            };
            Ok(value)
        })
        .collect()
}
