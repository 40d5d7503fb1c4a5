//! CLI argument parsing for drover.
//!
//! Uses clap derive macros. This module only defines the command structure;
//! implementations live in the `commands` module.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG: &str = "drover.yaml";

/// Drover: supervise a fleet of agent subprocesses that speak
/// newline-delimited JSON over stdio.
///
/// Agent summaries and in-process plugin events are aggregated into
/// activity segments and written to a JSON-lines file. A local Unix socket
/// lets other processes query and reconfigure the running orchestrator.
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator in the foreground.
    ///
    /// Starts every enabled agent, serves the control socket and ticks until
    /// SIGINT/SIGTERM or a `control_orchestrator` stop request.
    Run(RunArgs),

    /// Send one request to a running orchestrator and print the response.
    Ctl(CtlArgs),

    /// Validate a configuration file without starting anything.
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Run a single tick, then shut down.
    #[arg(long)]
    pub once: bool,
}

#[derive(Parser, Debug)]
pub struct CtlArgs {
    /// Control command, e.g. `ping` or `get_agent_states`.
    pub cmd: String,

    /// Command arguments as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub args: String,

    /// Socket path. Defaults to the one derived from the config file.
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Configuration file used to locate the socket.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Seconds to wait for the response.
    #[arg(long, default_value_t = 10.0)]
    pub timeout: f64,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
