//! In-process plugins.
//!
//! Legacy plugins run inside the orchestrator: the tick loop polls them for
//! events, and because they do not aggregate their own output the
//! [`SegmentAggregator`](crate::segment::SegmentAggregator) buffers values
//! under each plugin's data header and calls back into [`Plugin::reduce`]
//! when a segment closes. Out-of-process agents reach the segment only
//! through a [`SummaryPlugin`] that turns their summaries into events.

use crate::config::SegmentSourceConfig;
use crate::error::{DroverError, Result};
use crate::events::Event;
use crate::protocol::Envelope;
use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};
use std::cmp::Ordering;

/// An in-process event source with a segment-level reduction.
pub trait Plugin: Send {
    /// Unique label; events produced by this plugin carry it.
    fn label(&self) -> &str;

    /// Payload key whose values are buffered for reduction.
    fn data_header(&self) -> Option<&str> {
        None
    }

    /// Whether this plugin's events restart the cooldown countdown.
    fn is_resetting(&self) -> bool {
        true
    }

    /// Produce any events that happened since the last poll.
    fn poll(&mut self, _now: DateTime<Utc>) -> Vec<Event> {
        Vec::new()
    }

    /// Turn a summary from agent `agent` into an event of this plugin.
    fn on_summary(&mut self, _agent: &str, _summary: &Envelope) -> Option<Event> {
        None
    }

    /// Reduce the values buffered under `header` during one segment.
    fn reduce(&self, _header: &str, values: &[Value]) -> anyhow::Result<Value> {
        Ok(Value::Array(values.to_vec()))
    }
}

/// Common reductions plugins can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Sorted, de-duplicated values.
    UniqueSorted,
    Sum,
    Count,
    Last,
    Max,
    Min,
    /// Flatten arrays and collect scalars in arrival order.
    #[default]
    Concat,
}

impl Reduction {
    pub fn apply(&self, values: &[Value]) -> anyhow::Result<Value> {
        match self {
            Reduction::UniqueSorted => {
                let mut sorted = values.to_vec();
                sorted.sort_by(compare_values);
                sorted.dedup();
                Ok(Value::Array(sorted))
            }
            Reduction::Sum => sum(values),
            Reduction::Count => Ok(json!(values.len())),
            Reduction::Last => Ok(values.last().cloned().unwrap_or(Value::Null)),
            Reduction::Max => extreme(values, Ordering::Greater),
            Reduction::Min => extreme(values, Ordering::Less),
            Reduction::Concat => {
                let mut out = Vec::new();
                for value in values {
                    match value {
                        Value::Array(items) => out.extend(items.iter().cloned()),
                        other => out.push(other.clone()),
                    }
                }
                Ok(Value::Array(out))
            }
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn sum(values: &[Value]) -> anyhow::Result<Value> {
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut all_ints = true;

    for value in values {
        let Value::Number(n) = value else {
            bail!("cannot sum non-numeric value {}", value);
        };
        match n.as_i64() {
            Some(i) if all_ints => {
                int_total = int_total
                    .checked_add(i)
                    .ok_or_else(|| anyhow!("integer overflow while summing"))?;
            }
            _ => all_ints = false,
        }
        float_total += n.as_f64().unwrap_or(0.0);
    }

    if all_ints {
        Ok(json!(int_total))
    } else {
        Number::from_f64(float_total)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("sum is not a finite number"))
    }
}

fn extreme(values: &[Value], keep: Ordering) -> anyhow::Result<Value> {
    let mut best: Option<&Value> = None;
    for value in values {
        if !value.is_number() {
            bail!("cannot compare non-numeric value {}", value);
        }
        best = match best {
            Some(current) if compare_values(value, current) != keep => Some(current),
            _ => Some(value),
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

/// Republishes one agent's summaries as resetting (or not) plugin events.
#[derive(Debug, Clone)]
pub struct SummaryPlugin {
    label: String,
    agent: String,
    data_header: Option<String>,
    resetting: bool,
    reduction: Reduction,
}

impl SummaryPlugin {
    pub fn from_config(label: &str, source: &SegmentSourceConfig) -> Self {
        Self {
            label: label.to_string(),
            agent: source.agent.clone(),
            data_header: source.data_header.clone(),
            resetting: source.resetting,
            reduction: source.reduction,
        }
    }
}

impl Plugin for SummaryPlugin {
    fn label(&self) -> &str {
        &self.label
    }

    fn data_header(&self) -> Option<&str> {
        self.data_header.as_deref()
    }

    fn is_resetting(&self) -> bool {
        self.resetting
    }

    fn on_summary(&mut self, agent: &str, summary: &Envelope) -> Option<Event> {
        if agent != self.agent {
            return None;
        }
        let event = Event::at(summary.timestamp, self.label.as_str(), "summary")
            .with_payload(Value::Object(summary.data.clone()));
        Some(event)
    }

    fn reduce(&self, _header: &str, values: &[Value]) -> anyhow::Result<Value> {
        self.reduction.apply(values)
    }
}

/// Registered in-process plugins, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Labels and data headers must be unique, since a
    /// segment's aggregated values are keyed by header.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        if self.get(plugin.label()).is_some() {
            return Err(DroverError::UserError(format!(
                "plugin label '{}' is already registered",
                plugin.label()
            )));
        }
        if let Some(header) = plugin.data_header()
            && let Some(owner) = self.plugins.iter().find(|p| p.data_header() == Some(header))
        {
            return Err(DroverError::UserError(format!(
                "data header '{}' of plugin '{}' is already used by plugin '{}'",
                header,
                plugin.label(),
                owner.label()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|p| p.label() == label)
            .map(|p| p.as_ref())
    }

    /// Events from unknown labels are treated as non-resetting.
    pub fn is_resetting(&self, label: &str) -> bool {
        self.get(label).is_some_and(|p| p.is_resetting())
    }

    /// Poll every plugin once, in registration order.
    pub fn poll_all(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        self.plugins
            .iter_mut()
            .flat_map(|p| p.poll(now))
            .collect()
    }

    /// Events the plugins derive from one agent summary.
    pub fn summary_events(&mut self, agent: &str, summary: &Envelope) -> Vec<Event> {
        self.plugins
            .iter_mut()
            .filter_map(|p| p.on_summary(agent, summary))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// JSON description used by the control plane.
    pub fn describe(&self) -> Vec<Value> {
        self.plugins
            .iter()
            .map(|p| {
                json!({
                    "label": p.label(),
                    "data_header": p.data_header(),
                    "resetting": p.is_resetting(),
                })
            })
            .collect()
    }
}
