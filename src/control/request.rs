//! Control-plane request lines and the requests forwarded to the tick loop.

use crossbeam::channel::Sender;
use serde_json::{Map, Value};

/// Reply sent back from the tick loop: data on success, message on failure.
pub type ControlReply = Result<Value, String>;

/// A decoded request line.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    pub cmd: String,
    pub args: Map<String, Value>,
    pub request_id: Option<Value>,
}

impl RequestLine {
    /// Decode one line. The error carries whatever `request_id` could be
    /// recovered so the failure response can still be correlated.
    pub fn parse(line: &str) -> Result<Self, (String, Option<Value>)> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| (format!("invalid request JSON: {}", e), None))?;
        let Value::Object(mut object) = value else {
            return Err(("request must be a JSON object".to_string(), None));
        };

        let request_id = object.remove("request_id");
        let cmd = match object.remove("cmd") {
            Some(Value::String(cmd)) if !cmd.is_empty() => cmd,
            _ => return Err(("request is missing 'cmd'".to_string(), request_id)),
        };
        let args = match object.remove("args") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args,
            Some(_) => return Err(("'args' must be an object".to_string(), request_id)),
        };

        Ok(Self {
            cmd,
            args,
            request_id,
        })
    }

    /// String argument, if present.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// A request the connection thread could not answer itself.
///
/// The tick loop owns all mutable state, so it answers these through `reply`.
#[derive(Debug)]
pub struct ControlRequest {
    pub cmd: String,
    pub args: Map<String, Value>,
    reply: Sender<ControlReply>,
}

impl ControlRequest {
    pub fn new(cmd: String, args: Map<String, Value>, reply: Sender<ControlReply>) -> Self {
        Self { cmd, args, reply }
    }

    /// Send the reply. A caller that already gave up is not an error.
    pub fn respond(self, reply: ControlReply) {
        let _ = self.reply.send(reply);
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// Required string argument.
    pub fn require_str(&self, key: &str) -> Result<&str, String> {
        self.arg_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("'{}' requires a non-empty string argument '{}'", self.cmd, key))
    }

    /// Required object argument.
    pub fn require_object(&self, key: &str) -> Result<&Map<String, Value>, String> {
        self.args
            .get(key)
            .and_then(Value::as_object)
            .ok_or_else(|| format!("'{}' requires an object argument '{}'", self.cmd, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_cmd_args_and_request_id() {
        let line = RequestLine::parse(r#"{"cmd":"start_agent","args":{"label":"keys"},"request_id":"r1"}"#)
            .unwrap();
        assert_eq!(line.cmd, "start_agent");
        assert_eq!(line.arg_str("label"), Some("keys"));
        assert_eq!(line.request_id, Some(json!("r1")));
    }

    #[test]
    fn missing_args_default_to_empty() {
        let line = RequestLine::parse(r#"{"cmd":"ping"}"#).unwrap();
        assert!(line.args.is_empty());
        assert_eq!(line.request_id, None);
    }

    #[test]
    fn rejects_malformed_lines_keeping_request_id() {
        assert!(RequestLine::parse("not json").is_err());
        assert!(RequestLine::parse("[1,2]").is_err());

        let (error, id) = RequestLine::parse(r#"{"request_id":"r9"}"#).unwrap_err();
        assert!(error.contains("cmd"));
        assert_eq!(id, Some(json!("r9")));

        assert!(RequestLine::parse(r#"{"cmd":"ping","args":[1]}"#).is_err());
    }

    #[test]
    fn require_helpers_name_the_missing_argument() {
        let (tx, _rx) = crossbeam::channel::bounded(1);
        let request = ControlRequest::new(
            "stop_agent".to_string(),
            json!({"updates": {}}).as_object().unwrap().clone(),
            tx,
        );
        assert!(request.require_str("label").unwrap_err().contains("label"));
        assert!(request.require_object("updates").is_ok());
    }
}
