//! Event and segment records.
//!
//! An [`Event`] is an immutable fact produced by an in-process plugin (or
//! synthesised by the orchestrator for diagnostics and agent summaries). A
//! [`Segment`] is a closed window of activity built by the aggregator when the
//! cooldown expires; it stores compact [`EventRef`] projections instead of
//! full payloads.
//!
//! # Record Format
//!
//! Sinks persist records as JSON lines:
//!
//! - events: `{"type":"event","t":..,"l":..,"e":..,"payload":..,"hash":..}`
//! - segments: `{"type":"segment","start":..,"end":..,"duration_s":..,
//!   "labels":[..],"aggregated":{..},"resets_count":..,"events":[{"t","l","e"}]}`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Number of hex characters kept from the SHA-256 content digest.
const HASH_HEX_LEN: usize = 16;

/// Render a timestamp the way every record does (RFC 3339, `Z` suffix).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// An immutable, timestamped fact.
#[derive(Debug, Clone)]
pub struct Event {
    /// When the event happened (UTC).
    pub timestamp: DateTime<Utc>,

    /// Label of the plugin or agent that produced it.
    pub label: String,

    /// Event type, e.g. `keypress` or `summary`.
    pub event: String,

    /// Optional structured payload.
    pub payload: Option<Value>,

    hash: OnceLock<String>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.label == other.label
            && self.event == other.event
            && self.payload == other.payload
    }
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(label: impl Into<String>, event: impl Into<String>) -> Self {
        Self::at(Utc::now(), label, event)
    }

    /// Create a new event with an explicit timestamp.
    pub fn at(timestamp: DateTime<Utc>, label: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            timestamp,
            label: label.into(),
            event: event.into(),
            payload: None,
            hash: OnceLock::new(),
        }
    }

    /// Set the payload for this event.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self.hash = OnceLock::new();
        self
    }

    /// Look up a top-level payload field.
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref()?.as_object()?.get(key)
    }

    /// Content hash: truncated SHA-256 over the canonical JSON of the fields.
    ///
    /// Computed on first use and cached.
    pub fn content_hash(&self) -> &str {
        self.hash.get_or_init(|| {
            // serde_json maps are key-sorted, so this rendering is canonical.
            let canonical = json!({
                "t": format_timestamp(&self.timestamp),
                "l": self.label,
                "e": self.event,
                "payload": self.payload,
            })
            .to_string();
            let digest = Sha256::digest(canonical.as_bytes());
            digest
                .iter()
                .take(HASH_HEX_LEN / 2)
                .map(|b| format!("{:02x}", b))
                .collect()
        })
    }

    /// Project the event onto the compact form stored in segments.
    pub fn to_ref(&self) -> EventRef {
        EventRef {
            t: self.timestamp,
            l: self.label.clone(),
            e: self.event.clone(),
        }
    }

    /// Canonical JSON record for sinks.
    pub fn to_record(&self) -> Value {
        json!({
            "type": "event",
            "t": format_timestamp(&self.timestamp),
            "l": self.label,
            "e": self.event,
            "payload": self.payload,
            "hash": self.content_hash(),
        })
    }
}

/// Compact `(timestamp, label, event)` projection of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub t: DateTime<Utc>,
    pub l: String,
    pub e: String,
}

/// A closed, immutable window of aggregated activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: Vec<EventRef>,
    aggregated: Map<String, Value>,
    resets_count: u32,
}

impl Segment {
    /// Build a segment. An `end` earlier than `start` is clamped to `start`.
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        events: Vec<EventRef>,
        aggregated: Map<String, Value>,
        resets_count: u32,
    ) -> Self {
        Self {
            start,
            end: end.max(start),
            events,
            aggregated,
            resets_count,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration_s(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }

    pub fn events(&self) -> &[EventRef] {
        &self.events
    }

    pub fn aggregated(&self) -> &Map<String, Value> {
        &self.aggregated
    }

    pub fn resets_count(&self) -> u32 {
        self.resets_count
    }

    /// Sorted, de-duplicated labels of the events in this segment.
    pub fn labels(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|r| r.l.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Canonical JSON record for sinks.
    pub fn to_record(&self) -> Value {
        let events: Vec<Value> = self
            .events
            .iter()
            .map(|r| json!({"t": format_timestamp(&r.t), "l": r.l, "e": r.e}))
            .collect();

        json!({
            "type": "segment",
            "start": format_timestamp(&self.start),
            "end": format_timestamp(&self.end),
            "duration_s": self.duration_s(),
            "labels": self.labels(),
            "aggregated": self.aggregated,
            "resets_count": self.resets_count,
            "events": events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn content_hash_is_stable_and_truncated() {
        let event = Event::at(t0(), "keys", "press").with_payload(json!({"k": "a"}));
        let again = Event::at(t0(), "keys", "press").with_payload(json!({"k": "a"}));

        assert_eq!(event.content_hash().len(), HASH_HEX_LEN);
        assert_eq!(event.content_hash(), again.content_hash());
        assert!(event.content_hash().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_hash_changes_with_payload() {
        let a = Event::at(t0(), "keys", "press").with_payload(json!({"k": "a"}));
        let b = Event::at(t0(), "keys", "press").with_payload(json!({"k": "b"}));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn segment_end_is_never_before_start() {
        let segment = Segment::new(t0(), t0() - Duration::seconds(5), vec![], Map::new(), 0);
        assert_eq!(segment.end(), segment.start());
        assert_eq!(segment.duration_s(), 0.0);
    }

    #[test]
    fn segment_record_has_canonical_shape() {
        let events = vec![
            Event::at(t0(), "mouse", "move").to_ref(),
            Event::at(t0() + Duration::seconds(1), "keys", "press").to_ref(),
            Event::at(t0() + Duration::seconds(2), "keys", "press").to_ref(),
        ];
        let mut aggregated = Map::new();
        aggregated.insert("items".into(), json!(["a", "b"]));
        let segment = Segment::new(t0(), t0() + Duration::milliseconds(2500), events, aggregated, 2);

        let record = segment.to_record();
        assert_eq!(record["type"], "segment");
        assert_eq!(record["start"], "2024-01-01T00:00:00Z");
        assert_eq!(record["end"], "2024-01-01T00:00:02.500Z");
        assert_eq!(record["duration_s"], 2.5);
        assert_eq!(record["labels"], json!(["keys", "mouse"]));
        assert_eq!(record["aggregated"]["items"], json!(["a", "b"]));
        assert_eq!(record["resets_count"], 2);
        assert_eq!(record["events"][1], json!({"t": "2024-01-01T00:00:01Z", "l": "keys", "e": "press"}));
    }

    #[test]
    fn event_record_carries_hash() {
        let event = Event::at(t0(), "agent", "summary").with_payload(json!({"n": 1}));
        let record = event.to_record();
        assert_eq!(record["type"], "event");
        assert_eq!(record["hash"], event.content_hash());
        assert_eq!(record["payload"]["n"], 1);
    }
}
