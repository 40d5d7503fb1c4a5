//! In-memory sink for tests.

use super::Sink;
use crate::error::SinkError;
use crate::events::{Event, Segment};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Collects canonical records in a shared vector.
pub(crate) struct MemorySink {
    records: Arc<Mutex<Vec<Value>>>,
    closed: bool,
}

impl MemorySink {
    pub(crate) fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Handle that stays readable after the sink is moved into a `SinkSet`.
    pub(crate) fn records(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.records)
    }

    fn push(&mut self, record: Value) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed("memory".to_string()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError> {
        self.push(segment.to_record())
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError> {
        self.push(event.to_record())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;
        Ok(())
    }
}
