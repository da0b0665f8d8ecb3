//! `carquery check` - validate and repair a candidate statement without running it.

use std::process::ExitCode;

use anyhow::Result;
use carquery_sql::RepairPipeline;
use clap::Args;

use crate::cli::config::CarqueryConfig;
use crate::cli::output::{print_outcome, print_repairs};
use crate::cli::{CandidateArgs, EXIT_REJECTED};

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub candidate: CandidateArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Also list the repairs and pipeline stages
    #[arg(long)]
    pub trace: bool,
}

pub fn run(args: CheckArgs, config: &CarqueryConfig) -> Result<ExitCode> {
    let sql = args.candidate.read()?;
    let catalog = config.catalog()?;
    let report = RepairPipeline::new(&catalog)
        .with_cast_style(config.numeric.clone())
        .run(&sql);
    let accepted = report.outcome.is_accepted();

    if args.json {
        let json = if args.trace {
            serde_json::to_string_pretty(&report)?
        } else {
            serde_json::to_string_pretty(&report.outcome)?
        };
        println!("{}", json);
    } else {
        if args.trace {
            print_repairs(&report.repairs);
        }
        print_outcome(&report.outcome);
    }

    Ok(if accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REJECTED)
    })
}
