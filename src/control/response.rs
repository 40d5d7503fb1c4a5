//! Control-plane response lines.

use crate::events::format_timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One response line: `{"ok", "cmd", "timestamp", "data" | "error", "request_id"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub cmd: String,
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

impl ControlResponse {
    pub fn success(cmd: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            cmd: cmd.into(),
            timestamp: format_timestamp(&Utc::now()),
            data: Some(data),
            error: None,
            request_id: None,
        }
    }

    pub fn failure(cmd: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            cmd: cmd.into(),
            timestamp: format_timestamp(&Utc::now()),
            data: None,
            error: Some(error.into()),
            request_id: None,
        }
    }

    /// Build from a tick-loop reply.
    pub fn from_result(cmd: &str, result: Result<Value, String>) -> Self {
        match result {
            Ok(data) => Self::success(cmd, data),
            Err(error) => Self::failure(cmd, error),
        }
    }

    /// Echo a caller's correlation id. Null and empty-string ids are dropped.
    pub fn with_request_id(mut self, request_id: Option<&Value>) -> Self {
        self.request_id = request_id
            .filter(|id| !id.is_null() && id.as_str() != Some(""))
            .cloned();
        self
    }

    /// Serialized line including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"cmd":"","timestamp":"{}","error":"failed to encode response: {}"}}"#,
                self.timestamp, e
            )
        });
        line.push('\n');
        line
    }
}
