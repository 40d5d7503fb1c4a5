//! Console logging via `tracing-subscriber`.
//!
//! `RUST_LOG` takes precedence over the CLI verbosity. Logs go to stderr so
//! command output on stdout stays machine-readable.

use crate::error::{DroverError, Result};
use tracing_subscriber::EnvFilter;

/// Target under which agent `log` messages are re-emitted.
pub const AGENT_TARGET: &str = "drover::agent";

/// Default filter for a `-v` count.
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_for_verbosity(verbose)))
        .map_err(|e| DroverError::UserError(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .map_err(|e| DroverError::RuntimeError(format!("failed to initialise logging: {}", e)))
}
