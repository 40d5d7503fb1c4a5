//! Agent subprocesses.
//!
//! - **Resolve**: trusted entry-point resolution inside the plugin and
//!   template roots
//! - **Manager**: spawning with captured stdio and per-agent stderr logs
//! - **Handle**: ownership of one running agent, its reader thread and its
//!   inbound message channel

mod handle;
mod manager;
mod resolve;

// Re-export public API
pub use handle::{AgentHandle, CHANNEL_CAPACITY, HandshakeInfo, Lifecycle, StopOutcome};
pub use manager::{LABEL_ENV, ProcessManager};
pub use resolve::resolve_entry_point;
