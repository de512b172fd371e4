use std::process::ExitCode;

use clap::Parser;

mod commands;
mod telemetry;

/// Merge coordination queue for trunk-based development
///
/// mergeq serializes merges into a shared integration branch ("trunk").
/// Producers enqueue branches; one or more processors drain the queue in
/// arrival order, checking each branch for conflicts before merging it.
/// Conflict checks run against the object store only, so a conflicted
/// branch never dirties anyone's working copy.
///
/// QUICK START:
///
///   mergeq init
///   mergeq enqueue 101 feature/login
///   mergeq process          # or: mergeq process --watch
///   mergeq status
///
/// State lives in .mergeq/ next to the repository root. All commands are
/// safe to run concurrently from independent processes; a file lock
/// arbitrates queue mutations.
#[derive(Parser)]
#[command(name = "mergeq")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'mergeq <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();
    match commands::run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(mergeq::processor::EXIT_FAILURE)
        }
    }
}
