//! `carquery run` - repair a candidate and execute it read-only.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use carquery_db::{ExecutionError, InventoryDb, QueryOutput};
use clap::Args;
use tracing::info;

use crate::cli::config::CarqueryConfig;
use crate::cli::output::{format_value, print_table};
use crate::cli::{CandidateArgs, EXIT_REJECTED};

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub candidate: CandidateArgs,

    /// SQLite database (default: [execution].database)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Maximum rows to return (default: [execution].row_cap)
    #[arg(long)]
    pub rows: Option<usize>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: RunArgs, config: &CarqueryConfig) -> Result<ExitCode> {
    let sql = args.candidate.read()?;
    let catalog = config.catalog()?;
    let db_path = match args.db {
        Some(path) => path,
        None => config.database_path()?,
    };
    let row_cap = args.rows.unwrap_or(config.execution.row_cap);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(async {
        let db = InventoryDb::open_read_only(&db_path)
            .await?
            .with_statement_timeout(config.statement_timeout());
        let result = db
            .execute_validated(&sql, &catalog, &config.numeric, row_cap)
            .await;
        db.close().await;
        result
    });

    let output = match result {
        Ok(output) => output,
        Err(ExecutionError::Rejected { reason, message }) => {
            if args.json {
                let json = serde_json::json!({
                    "status": "rejected",
                    "reason": reason,
                    "message": message,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else {
                eprintln!("Rejected [{}]: {}", reason, message);
            }
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Query failed against {}", db_path.display()))
        }
    };

    info!(rows = output.rows.len(), total = output.total_count, "query executed");
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_output(output: &QueryOutput) {
    eprintln!("-- {}", output.sql);
    let headers: Vec<&str> = output.columns.iter().map(String::as_str).collect();
    let rows = output
        .rows
        .iter()
        .map(|row| row.iter().map(format_value).collect())
        .collect();
    print_table(&headers, rows);
    if output.truncated {
        println!("{} of {} rows", output.rows.len(), output.total_count);
    } else {
        println!("{} rows", output.total_count);
    }
}
