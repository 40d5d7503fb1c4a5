//! Rolling per-tick timing and message counts.
//!
//! Telemetry is observational only; nothing in the scheduler reads it back.

use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Number of ticks kept in the rolling window.
pub const TELEMETRY_WINDOW: usize = 120;

/// Tick stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Control,
    Reap,
    Plugins,
    Agents,
    Telemetry,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Control,
        Stage::Reap,
        Stage::Plugins,
        Stage::Agents,
        Stage::Telemetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Control => "control",
            Stage::Reap => "reap",
            Stage::Plugins => "plugins",
            Stage::Agents => "agents",
            Stage::Telemetry => "telemetry",
        }
    }
}

/// Measurements for one tick.
#[derive(Debug, Clone, Default)]
pub struct TickSample {
    pub duration: Duration,
    pub stages: BTreeMap<Stage, Duration>,
    pub agent_drain: BTreeMap<String, Duration>,
    pub messages: BTreeMap<String, u64>,
}

impl TickSample {
    pub fn record_stage(&mut self, stage: Stage, elapsed: Duration) {
        *self.stages.entry(stage).or_default() += elapsed;
    }

    pub fn record_drain(&mut self, label: &str, elapsed: Duration) {
        *self.agent_drain.entry(label.to_string()).or_default() += elapsed;
    }

    pub fn count_message(&mut self, type_name: &str) {
        *self.messages.entry(type_name.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    window: VecDeque<TickSample>,
    capacity: usize,
    total_ticks: u64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::with_capacity(TELEMETRY_WINDOW)
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_ticks: 0,
        }
    }

    pub fn record(&mut self, sample: TickSample) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.total_ticks += 1;
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn latest(&self) -> Option<&TickSample> {
        self.window.back()
    }

    /// Averages and maxima over the window, in milliseconds.
    pub fn summary(&self) -> Value {
        let samples = self.window.len();
        if samples == 0 {
            return json!({"samples": 0, "total_ticks": self.total_ticks});
        }

        let ms = |d: Duration| d.as_micros() as f64 / 1000.0;
        let avg_of = |f: &dyn Fn(&TickSample) -> Duration| {
            self.window.iter().map(|s| ms(f(s))).sum::<f64>() / samples as f64
        };

        let tick_avg = avg_of(&|s| s.duration);
        let tick_max = self
            .window
            .iter()
            .map(|s| ms(s.duration))
            .fold(0.0_f64, f64::max);

        let stages: serde_json::Map<String, Value> = Stage::ALL
            .iter()
            .map(|stage| {
                let avg = avg_of(&|s| s.stages.get(stage).copied().unwrap_or_default());
                (stage.as_str().to_string(), json!(avg))
            })
            .collect();

        let mut drain_max: BTreeMap<&str, f64> = BTreeMap::new();
        let mut messages: BTreeMap<&str, u64> = BTreeMap::new();
        for sample in &self.window {
            for (label, elapsed) in &sample.agent_drain {
                let entry = drain_max.entry(label.as_str()).or_default();
                *entry = entry.max(ms(*elapsed));
            }
            for (kind, count) in &sample.messages {
                *messages.entry(kind.as_str()).or_default() += *count;
            }
        }

        json!({
            "samples": samples,
            "total_ticks": self.total_ticks,
            "tick_ms_avg": tick_avg,
            "tick_ms_max": tick_max,
            "stage_ms_avg": stages,
            "agent_drain_ms_max": drain_max,
            "messages": messages,
        })
    }
}
