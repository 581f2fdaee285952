use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Debug, Parser)]
#[command(
    name = "archive-writer",
    version,
    about = "Archive event-bus envelopes exactly once into object storage"
)]
struct Cli {
    /// Profile file (YAML, or TOML when the extension is .toml).
    #[arg(long, global = true)]
    profile: Option<PathBuf>,
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the bus and archive new records.
    Run {
        /// Run a single poll cycle and exit.
        #[arg(long)]
        once: bool,
        /// Exit after this many poll cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
        /// Override the idle sleep between empty cycles.
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Show ledger statistics, checkpoints and the last exported health.
    Status {
        /// Platform run whose exported metrics to read.
        #[arg(long = "run")]
        platform_run_id: Option<String>,
    },
    /// Check configuration, environment and backend reachability.
    Verify {
        #[arg(long)]
        strict: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let profile = cli.profile.clone();

    let report = match cli.command {
        Command::Run {
            once,
            max_cycles,
            poll_interval_ms,
        } => commands::run::run(&commands::run::RunOptions {
            profile,
            once,
            max_cycles,
            poll_interval_ms,
        })?,
        Command::Status { platform_run_id } => {
            commands::status::run(&commands::status::StatusOptions {
                profile,
                platform_run_id,
            })?
        }
        Command::Verify { strict } => commands::verify::run(&commands::verify::VerifyOptions {
            profile,
            strict,
        })?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let state = if report.ok { "ok" } else { "failed" };
    println!("{}: {state}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}
