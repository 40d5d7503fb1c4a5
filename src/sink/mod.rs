//! Output sinks.
//!
//! A sink persists closed segments and standalone events. Sinks are owned by
//! the tick loop; their failures are logged and never abort a tick.

mod jsonl;
#[cfg(test)]
pub(crate) mod memory;

pub use jsonl::JsonlSink;

use crate::error::SinkError;
use crate::events::{Event, Segment};
use tracing::{error, warn};

/// Destination for segments and events.
pub trait Sink: Send {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError>;

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Flush and release resources. Writes after close fail with `Closed`.
    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Fan-out over every configured sink, logging failures per sink.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Returns the number of sinks that failed.
    pub fn write_segment(&mut self, segment: &Segment) -> usize {
        let mut failures = 0;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_segment(segment) {
                error!(sink = sink.name(), error = %e, "failed to write segment");
                failures += 1;
            }
        }
        failures
    }

    /// Returns the number of sinks that failed.
    pub fn write_event(&mut self, event: &Event) -> usize {
        let mut failures = 0;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_event(event) {
                warn!(sink = sink.name(), event = %event.event, error = %e, "failed to write event");
                failures += 1;
            }
        }
        failures
    }

    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!(sink = sink.name(), error = %e, "failed to flush sink");
            }
        }
    }

    pub fn close(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.close() {
                warn!(sink = sink.name(), error = %e, "failed to close sink");
            }
        }
    }
}
