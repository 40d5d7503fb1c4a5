//! Buffers in-process plugin output for the open segment and reduces it into a
//! [`Segment`] when the cooldown closes it.

use super::cooldown::SegmentState;
use crate::error::AggregationError;
use crate::events::{Event, EventRef, Segment};
use crate::plugins::PluginRegistry;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Values buffered under one data header.
#[derive(Debug)]
struct HeaderBuffer {
    label: String,
    header: String,
    values: Vec<Value>,
}

/// Per-segment event and value buffers.
#[derive(Debug, Default)]
pub struct SegmentAggregator {
    events: Vec<EventRef>,
    /// In first-seen order; headers are few, so a linear scan is fine.
    buffers: Vec<HeaderBuffer>,
}

impl SegmentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event for the open segment.
    pub fn add_event(&mut self, event: &Event, registry: &PluginRegistry) {
        self.events.push(event.to_ref());

        let Some(header) = registry.get(&event.label).and_then(|p| p.data_header()) else {
            return;
        };
        let Some(value) = event.payload_field(header) else {
            return;
        };

        match self
            .buffers
            .iter_mut()
            .find(|b| b.label == event.label && b.header == header)
        {
            Some(buffer) => buffer.values.push(value.clone()),
            None => self.buffers.push(HeaderBuffer {
                label: event.label.clone(),
                header: header.to_string(),
                values: vec![value.clone()],
            }),
        }
    }

    /// Reduce the buffered values and produce the closed segment.
    ///
    /// Buffers are cleared whether or not the build succeeds. `end` defaults to
    /// the later of the segment's start and its last event.
    pub fn build_segment(
        &mut self,
        state: SegmentState,
        registry: &PluginRegistry,
        end: Option<DateTime<Utc>>,
    ) -> Result<Segment, AggregationError> {
        let events = std::mem::take(&mut self.events);
        let buffers = std::mem::take(&mut self.buffers);

        let mut aggregated = Map::new();
        for buffer in buffers {
            let Some(plugin) = registry.get(&buffer.label) else {
                return Err(AggregationError {
                    label: buffer.label,
                    header: buffer.header,
                    reason: "plugin is no longer registered".to_string(),
                });
            };
            let reduced = plugin
                .reduce(&buffer.header, &buffer.values)
                .map_err(|e| AggregationError {
                    label: buffer.label.clone(),
                    header: buffer.header.clone(),
                    reason: format!("{:#}", e),
                })?;
            aggregated.insert(buffer.header, reduced);
        }

        let end = end.unwrap_or_else(|| state.last_event.max(state.start));
        Ok(Segment::new(
            state.start,
            end,
            events,
            aggregated,
            state.resets_count,
        ))
    }

    /// Number of events buffered for the open segment.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.buffers.is_empty()
    }
}
