//! Agent → orchestrator message model.

use super::command::CommandKind;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Protocol version assumed when an agent omits `protocol_version`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Self-reported agent health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Degraded,
    Overload,
    Failed,
}

impl Health {
    /// Parse a wire health string. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "degraded" => Some(Self::Degraded),
            "overload" => Some(Self::Overload),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "ok",
            Health::Degraded => "degraded",
            Health::Overload => "overload",
            Health::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every agent message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// When the agent produced the message (UTC).
    pub timestamp: DateTime<Utc>,

    /// Instance id, unique per agent process.
    pub agent_id: String,

    /// Logical id, matching the configured agent label.
    pub agent_label: String,

    pub protocol_version: String,
    pub agent_version: String,

    /// Type-specific payload.
    pub data: Map<String, Value>,

    pub metrics: Option<Map<String, Value>>,
    pub health: Option<Health>,
    pub message: Option<String>,
}

impl Envelope {
    /// Create an envelope stamped with the current time and an empty payload.
    pub fn new(
        agent_label: impl Into<String>,
        agent_id: impl Into<String>,
        agent_version: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            agent_label: agent_label.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_version: agent_version.into(),
            data: Map::new(),
            metrics: None,
            health: None,
            message: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Replace the payload. Non-object values are ignored.
    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        if let Value::Object(map) = metrics {
            self.metrics = Some(map);
        }
        self
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Discriminator of an [`AgentMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Handshake,
    Summary,
    Heartbeat,
    Status,
    Error,
    Ack,
    Log,
    Other,
}

impl MessageKind {
    /// Map a wire `type` string onto a kind; anything unrecognised is `Other`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "handshake" => Self::Handshake,
            "summary" => Self::Summary,
            "heartbeat" => Self::Heartbeat,
            "status" => Self::Status,
            "error" => Self::Error,
            "ack" => Self::Ack,
            "log" => Self::Log,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::Summary => "summary",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Ack => "ack",
            MessageKind::Log => "log",
            MessageKind::Other => "other",
        }
    }
}

/// A decoded agent message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// First message of a session: protocol/version/capabilities.
    Handshake(Envelope),
    /// Pre-aggregated output, written to sinks as-is.
    Summary(Envelope),
    Heartbeat(Envelope),
    Status(Envelope),
    Error(Envelope),
    /// Acknowledgement of a command; `data.command` names it.
    Ack(Envelope),
    /// Free-form log line; `data.level` selects the console level.
    Log(Envelope),
    /// A message type this build does not know about.
    Other { kind: String, envelope: Envelope },
}

impl AgentMessage {
    /// Build a message from a wire type string and an envelope.
    pub fn from_parts(kind: &str, envelope: Envelope) -> Self {
        match MessageKind::from_wire(kind) {
            MessageKind::Handshake => Self::Handshake(envelope),
            MessageKind::Summary => Self::Summary(envelope),
            MessageKind::Heartbeat => Self::Heartbeat(envelope),
            MessageKind::Status => Self::Status(envelope),
            MessageKind::Error => Self::Error(envelope),
            MessageKind::Ack => Self::Ack(envelope),
            MessageKind::Log => Self::Log(envelope),
            MessageKind::Other => Self::Other {
                kind: kind.to_string(),
                envelope,
            },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            AgentMessage::Handshake(_) => MessageKind::Handshake,
            AgentMessage::Summary(_) => MessageKind::Summary,
            AgentMessage::Heartbeat(_) => MessageKind::Heartbeat,
            AgentMessage::Status(_) => MessageKind::Status,
            AgentMessage::Error(_) => MessageKind::Error,
            AgentMessage::Ack(_) => MessageKind::Ack,
            AgentMessage::Log(_) => MessageKind::Log,
            AgentMessage::Other { .. } => MessageKind::Other,
        }
    }

    /// The wire `type` string, preserving unknown discriminators.
    pub fn type_name(&self) -> &str {
        match self {
            AgentMessage::Other { kind, .. } => kind,
            other => other.kind().as_str(),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            AgentMessage::Handshake(e)
            | AgentMessage::Summary(e)
            | AgentMessage::Heartbeat(e)
            | AgentMessage::Status(e)
            | AgentMessage::Error(e)
            | AgentMessage::Ack(e)
            | AgentMessage::Log(e) => e,
            AgentMessage::Other { envelope, .. } => envelope,
        }
    }

    /// For acks, the command being acknowledged.
    pub fn acked_command(&self) -> Option<CommandKind> {
        let AgentMessage::Ack(envelope) = self else {
            return None;
        };
        envelope
            .data
            .get("command")
            .or_else(|| envelope.data.get("cmd"))
            .and_then(Value::as_str)
            .and_then(CommandKind::parse)
    }

    /// Short human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        let envelope = self.envelope();
        match &envelope.message {
            Some(text) => format!("{} from {}: {}", self.type_name(), envelope.agent_label, text),
            None => format!("{} from {}", self.type_name(), envelope.agent_label),
        }
    }
}
