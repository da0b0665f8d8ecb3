//! Command implementations for the `carquery` binary.

pub mod check;
pub mod config;
pub mod output;
pub mod run;
pub mod schema;

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

/// Exit status for a candidate the engine refused.
pub const EXIT_REJECTED: u8 = 2;

/// Where the candidate SQL comes from.
#[derive(Debug, Args)]
pub struct CandidateArgs {
    /// Candidate SQL (use `-` to read stdin)
    #[arg(value_name = "SQL", required_unless_present = "file")]
    pub sql: Option<String>,

    /// Read the candidate SQL from a file
    #[arg(long, short, conflicts_with = "sql")]
    pub file: Option<PathBuf>,
}

impl CandidateArgs {
    pub fn read(&self) -> Result<String> {
        let text = match (&self.sql, &self.file) {
            (_, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read SQL file: {}", path.display()))?,
            (Some(sql), None) if sql == "-" => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read SQL from stdin")?;
                buf
            }
            (Some(sql), None) => sql.clone(),
            (None, None) => bail!("No SQL given"),
        };
        if text.trim().is_empty() {
            bail!("Candidate SQL is empty");
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_candidate_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("q.sql");
        std::fs::write(&path, "SELECT mark FROM cars\n").unwrap();
        let args = CandidateArgs {
            sql: None,
            file: Some(path),
        };
        assert_eq!(args.read().unwrap(), "SELECT mark FROM cars\n");
    }

    #[test]
    fn test_blank_candidate_is_an_error() {
        let args = CandidateArgs {
            sql: Some("   ".to_string()),
            file: None,
        };
        assert!(args.read().is_err());
    }
}
