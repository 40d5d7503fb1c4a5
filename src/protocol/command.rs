//! Orchestrator → agent command model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command kinds understood by agents. Serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Ack,
    Reject,
    Flush,
    Status,
    Shutdown,
    Stop,
    Start,
    Sequence,
}

impl CommandKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ack" => Some(Self::Ack),
            "reject" => Some(Self::Reject),
            "flush" => Some(Self::Flush),
            "status" => Some(Self::Status),
            "shutdown" => Some(Self::Shutdown),
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            "sequence" => Some(Self::Sequence),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ack => "ack",
            CommandKind::Reject => "reject",
            CommandKind::Flush => "flush",
            CommandKind::Status => "status",
            CommandKind::Shutdown => "shutdown",
            CommandKind::Stop => "stop",
            CommandKind::Start => "start",
            CommandKind::Sequence => "sequence",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command sent to an agent on its stdin.
///
/// Serialized as `{"cmd":"flush","args":{},"id":"..."}`; `sequence` commands
/// additionally carry `"sequence":[{..},{..}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorCommand {
    #[serde(rename = "cmd")]
    pub kind: CommandKind,

    #[serde(default)]
    pub args: Map<String, Value>,

    /// Correlation id echoed back in acks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Ordered sub-commands; only meaningful for `sequence`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<OrchestratorCommand>,
}

impl OrchestratorCommand {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            args: Map::new(),
            id: None,
            sequence: Vec::new(),
        }
    }

    pub fn flush() -> Self {
        Self::new(CommandKind::Flush)
    }

    pub fn stop() -> Self {
        Self::new(CommandKind::Stop)
    }

    pub fn start() -> Self {
        Self::new(CommandKind::Start)
    }

    pub fn shutdown() -> Self {
        Self::new(CommandKind::Shutdown)
    }

    pub fn status() -> Self {
        Self::new(CommandKind::Status)
    }

    /// Build a `sequence` command from ordered steps.
    pub fn sequence(steps: Vec<OrchestratorCommand>) -> Self {
        Self {
            sequence: steps,
            ..Self::new(CommandKind::Sequence)
        }
    }

    /// The `[stop, flush, shutdown]` sequence used for graceful shutdown.
    pub fn shutdown_sequence(id: impl Into<String>) -> Self {
        Self::sequence(vec![Self::stop(), Self::flush(), Self::shutdown()]).with_id(id)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}
