//! Drover: a local orchestrator for stdio-speaking agent subprocesses.
//!
//! This is the entry point for the `drover` CLI. It parses arguments,
//! dispatches to the command handler and maps errors onto exit codes.

mod agent;
mod cli;
mod commands;
mod config;
mod control;
mod error;
mod events;
mod exit_codes;
mod fs;
mod locks;
mod logging;
mod plugins;
mod protocol;
mod runtime;
mod segment;
mod shutdown;
mod signals;
mod sink;
mod templates;

#[cfg(test)]
mod test_support;

use cli::Cli;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match commands::dispatch(cli.command) {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
