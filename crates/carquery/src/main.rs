//! carquery: check, repair and run generated inventory SQL.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use carquery_logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use tracing::debug;

mod cli;

use cli::config::CarqueryConfig;

#[derive(Parser, Debug)]
#[command(name = "carquery", version, about = "Safety-and-repair gate for generated inventory SQL")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.carquery/config.toml)
    #[arg(long, global = true, env = "CARQUERY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate and repair a candidate statement
    Check(cli::check::CheckArgs),

    /// Validate, repair and execute a candidate against the inventory database
    Run(cli::run::RunArgs),

    /// Show the active schema catalog
    Schema {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "carquery",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: logging disabled: {:#}", err);
    }

    match run_command(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_command(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => CarqueryConfig::load(path)?,
        None => CarqueryConfig::load_default()?,
    };
    debug!(command = ?cli.command, "dispatching");

    match cli.command {
        Commands::Check(args) => cli::check::run(args, &config),
        Commands::Run(args) => cli::run::run(args, &config),
        Commands::Schema { json } => {
            cli::schema::run(json, &config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
