//! Orderly shutdown of every agent.
//!
//! Each live agent receives one atomic `sequence[stop, flush, shutdown]`
//! command and is tracked by a [`ShutdownTracker`] until it has answered with
//! all four signals, exited, or gone quiet past the shutdown timeout. Missing
//! signals are reported individually, survivors are killed, and the segment
//! pipeline and control server are closed last.

mod sequencer;
mod tracker;

#[cfg(test)]
mod tests;

pub use sequencer::{AgentShutdown, ShutdownContext, ShutdownReport, ShutdownSequencer};
pub use tracker::{ShutdownPhase, ShutdownSignal, ShutdownTracker};
