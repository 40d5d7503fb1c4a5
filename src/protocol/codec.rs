//! Line codec for the stdio protocol.

use super::command::OrchestratorCommand;
use super::message::{AgentMessage, Envelope, Health, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Decode one inbound line into a typed message.
///
/// Fails on malformed JSON, non-object input, or a missing required field
/// (`type`, `timestamp`, `agent_id`, `agent_label`, `agent_version`).
/// Unknown fields are ignored and unknown types decode to
/// [`AgentMessage::Other`].
pub fn decode_line(line: &str) -> Result<AgentMessage, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim_end())
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = required_string(&mut obj, "type")?;
    let timestamp = parse_timestamp(&required_string(&mut obj, "timestamp")?)?;
    let agent_id = required_string(&mut obj, "agent_id")?;
    let agent_label = required_string(&mut obj, "agent_label")?;
    let agent_version = required_string(&mut obj, "agent_version")?;

    let protocol_version = match obj.remove("protocol_version") {
        None | Some(Value::Null) => PROTOCOL_VERSION.to_string(),
        Some(value) => scalar_to_string(value).ok_or(ProtocolError::InvalidField {
            field: "protocol_version",
            reason: "expected a string or number".to_string(),
        })?,
    };

    let data = match obj.remove("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "data",
                reason: "expected an object".to_string(),
            });
        }
    };

    // Optional fields degrade to absent when they carry an unexpected shape.
    let metrics = match obj.remove("metrics") {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };
    let health = match obj.remove("health") {
        Some(Value::String(s)) => Health::parse(&s),
        _ => None,
    };
    let message = match obj.remove("message") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };

    let envelope = Envelope {
        timestamp,
        agent_id,
        agent_label,
        protocol_version,
        agent_version,
        data,
        metrics,
        health,
        message,
    };

    Ok(AgentMessage::from_parts(&kind, envelope))
}

/// Encode a message as one newline-terminated JSON line.
pub fn encode_message(message: &AgentMessage) -> String {
    let envelope = message.envelope();
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(message.type_name().to_string()));
    obj.insert(
        "timestamp".into(),
        Value::String(
            envelope
                .timestamp
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
    );
    obj.insert("agent_id".into(), Value::String(envelope.agent_id.clone()));
    obj.insert(
        "agent_label".into(),
        Value::String(envelope.agent_label.clone()),
    );
    obj.insert(
        "protocol_version".into(),
        Value::String(envelope.protocol_version.clone()),
    );
    obj.insert(
        "agent_version".into(),
        Value::String(envelope.agent_version.clone()),
    );
    obj.insert("data".into(), Value::Object(envelope.data.clone()));
    if let Some(metrics) = &envelope.metrics {
        obj.insert("metrics".into(), Value::Object(metrics.clone()));
    }
    if let Some(health) = envelope.health {
        obj.insert("health".into(), Value::String(health.as_str().to_string()));
    }
    if let Some(text) = &envelope.message {
        obj.insert("message".into(), Value::String(text.clone()));
    }

    let mut line = Value::Object(obj).to_string();
    line.push('\n');
    line
}

/// Encode a command as one newline-terminated JSON line.
pub fn encode_command(command: &OrchestratorCommand) -> String {
    // Serializing a struct of strings, maps and vectors cannot fail.
    let mut line = serde_json::to_string(command).unwrap_or_default();
    line.push('\n');
    line
}

/// Decode a command line, as an agent would.
pub fn decode_command(line: &str) -> Result<OrchestratorCommand, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

fn required_string(obj: &mut Map<String, Value>, field: &'static str) -> Result<String, ProtocolError> {
    match obj.remove(field) {
        None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
        Some(value) => scalar_to_string(value).ok_or(ProtocolError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        }),
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an ISO-8601 timestamp; values without an offset are taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ProtocolError::InvalidField {
            field: "timestamp",
            reason: format!("'{}' is not ISO-8601: {}", raw, e),
        })
}
