//! State owned by the tick loop thread.

use super::actions::LifecycleAction;
use crate::agent::{AgentHandle, Lifecycle};
use crate::events::{Event, format_timestamp};
use crate::plugins::PluginRegistry;
use crate::protocol::Envelope;
use crate::segment::{CooldownSignal, CooldownState, CooldownTimer, SegmentAggregator};
use crate::sink::SinkSet;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;
use tracing::{debug, error, info};

/// Why the last spawn of an agent failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnFailure {
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl SpawnFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "message": self.reason,
            "at": format_timestamp(&self.at),
        })
    }
}

/// Live agents plus the bookkeeping the status command reports.
#[derive(Debug)]
pub struct RuntimeState {
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub tick_count: u64,
    pub agents: BTreeMap<String, AgentHandle>,
    /// Handles told to stop, waiting to exit or hit their kill deadline.
    pub stopping: BTreeMap<String, AgentHandle>,
    /// Labels to spawn again once their stopping handle is gone.
    pub respawn: BTreeSet<String>,
    pub spawn_failures: BTreeMap<String, SpawnFailure>,
    pub pending: VecDeque<LifecycleAction>,
    pub agents_reaped: u64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            tick_count: 0,
            agents: BTreeMap::new(),
            stopping: BTreeMap::new(),
            respawn: BTreeSet::new(),
            spawn_failures: BTreeMap::new(),
            pending: VecDeque::new(),
            agents_reaped: 0,
        }
    }

    pub fn uptime_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Whether `label` has a handle whose process is still running.
    pub fn is_running(&mut self, label: &str) -> bool {
        self.agents.get_mut(label).is_some_and(|h| h.is_alive())
    }

    /// The handle for `label`, live or still stopping.
    pub fn handle(&self, label: &str) -> Option<&AgentHandle> {
        self.agents.get(label).or_else(|| self.stopping.get(label))
    }

    /// Count of handles per lifecycle state.
    pub fn agent_counts(&self) -> Value {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for handle in self.agents.values().chain(self.stopping.values()) {
            *counts.entry(handle.lifecycle().as_str()).or_default() += 1;
        }
        if !self.spawn_failures.is_empty() {
            *counts.entry("error").or_default() += self.spawn_failures.len();
        }
        json!({
            "live": self.agents.len(),
            "stopping": self.stopping.len(),
            "by_lifecycle": counts,
            "reaped": self.agents_reaped,
            "spawn_failures": self.spawn_failures.len(),
        })
    }

    pub fn live_labels(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|(_, h)| h.lifecycle() != Lifecycle::Inactive)
            .map(|(label, _)| label.clone())
            .collect()
    }
}

/// Counters for what reached the sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub events_written: u64,
    pub segments_written: u64,
    pub segments_dropped: u64,
}

/// In-process plugins, the open segment, and the sinks it ends up in.
pub struct SegmentPipeline {
    pub plugins: PluginRegistry,
    pub aggregator: SegmentAggregator,
    pub cooldown: CooldownTimer,
    pub sinks: SinkSet,
    pub stats: PipelineStats,
}

impl SegmentPipeline {
    pub fn new(plugins: PluginRegistry, cooldown: CooldownTimer, sinks: SinkSet) -> Self {
        Self {
            plugins,
            aggregator: SegmentAggregator::new(),
            cooldown,
            sinks,
            stats: PipelineStats::default(),
        }
    }

    /// Write a standalone event to every sink.
    pub fn write_event(&mut self, event: &Event) {
        self.sinks.write_event(event);
        self.stats.events_written += 1;
    }

    /// Poll every plugin and feed what they produced. Returns the event count.
    pub fn poll_plugins(&mut self, now: DateTime<Utc>) -> usize {
        let events = self.plugins.poll_all(now);
        let count = events.len();
        for event in events {
            self.ingest(event);
        }
        count
    }

    /// Route one plugin event to the sinks, the cooldown and the aggregator.
    ///
    /// Non-resetting events only join a segment that is already open.
    pub fn ingest(&mut self, event: Event) {
        self.write_event(&event);

        if self.plugins.is_resetting(&event.label) {
            if self.cooldown.on_resetting_event(event.timestamp) == CooldownSignal::Opened {
                debug!(plugin = %event.label, "segment opened");
            }
        } else {
            self.cooldown.on_non_resetting_event(event.timestamp);
        }

        if self.cooldown.state() != CooldownState::Idle {
            self.aggregator.add_event(&event, &self.plugins);
        }
    }

    /// Feed one agent summary to the plugins that republish it.
    pub fn ingest_summary(&mut self, agent: &str, summary: &Envelope) {
        for event in self.plugins.summary_events(agent, summary) {
            self.ingest(event);
        }
    }

    /// Close and write the open segment once its cooldown has elapsed.
    pub fn close_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if !self.cooldown.check_expiration(now) {
            return false;
        }
        self.close_segment();
        true
    }

    /// Close whatever segment is open, e.g. at shutdown.
    pub fn close_open_segment(&mut self) -> bool {
        if self.cooldown.state() == CooldownState::Idle {
            return false;
        }
        self.close_segment();
        true
    }

    fn close_segment(&mut self) {
        let state = match self.cooldown.close_segment() {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "cooldown timer out of step with the tick loop");
                return;
            }
        };

        match self.aggregator.build_segment(state, &self.plugins, None) {
            Ok(segment) => {
                let failures = self.sinks.write_segment(&segment);
                self.stats.segments_written += 1;
                info!(
                    start = %format_timestamp(&segment.start()),
                    duration_s = segment.duration_s(),
                    events = segment.events().len(),
                    resets = segment.resets_count(),
                    sink_failures = failures,
                    "segment closed"
                );
            }
            Err(e) => {
                self.stats.segments_dropped += 1;
                error!(error = %e, "segment dropped");
            }
        }
    }

    /// JSON view of the open segment, `null` when idle.
    pub fn segment_info(&self) -> Value {
        match self.cooldown.segment_state() {
            Some(state) => json!({
                "state": self.cooldown.state().as_str(),
                "start": format_timestamp(&state.start),
                "last_event": format_timestamp(&state.last_event),
                "resets_count": state.resets_count,
                "buffered_events": self.aggregator.event_count(),
            }),
            None => Value::Null,
        }
    }
}
