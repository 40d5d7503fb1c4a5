//! The orchestrator runtime.
//!
//! A single thread owns every agent handle, the segment pipeline and the
//! config, and drives them with a fixed-cadence tick:
//!
//! 1. answer control requests, then apply the lifecycle actions they queued
//! 2. reap agents whose process exited on its own
//! 3. poll in-process plugins and close an expired segment
//! 4. send due flushes and drain each agent's channel
//! 5. check heartbeats and record tick telemetry

mod actions;
mod orchestrator;
mod state;
mod telemetry;
mod tick;


pub use actions::LifecycleAction;
pub use orchestrator::Orchestrator;
pub use state::{PipelineStats, RuntimeState, SegmentPipeline};
pub use telemetry::{Stage, TELEMETRY_WINDOW, Telemetry, TickSample};
pub use tick::{MAX_DRAIN_PER_TICK, route_message, summary_event};
