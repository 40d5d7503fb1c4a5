//! Segment lifecycle: the cooldown state machine that decides segment
//! boundaries, and the aggregator that turns buffered plugin output into an
//! immutable [`Segment`](crate::events::Segment) when a segment closes.

mod aggregator;
mod cooldown;

pub use aggregator::SegmentAggregator;
pub use cooldown::{CooldownSignal, CooldownState, CooldownTimer, SegmentState};
