//! Command implementations for drover.
//!
//! Routes each parsed CLI command to its handler.

mod check;
mod ctl;
mod run;

use crate::cli::Command;
use crate::error::Result;

pub fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => run::cmd_run(args),
        Command::Ctl(args) => ctl::cmd_ctl(args),
        Command::Check(args) => check::cmd_check(args),
    }
}
