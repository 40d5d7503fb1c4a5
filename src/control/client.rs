//! Blocking client for the control socket.

use super::response::ControlResponse;
use crate::error::ControlError;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time to wait for a response; longer than the server's reply wait.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends one request per connection and reads one response line.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn request(&self, cmd: &str, args: Value) -> Result<ControlResponse, ControlError> {
        self.request_with_id(cmd, args, None)
    }

    pub fn request_with_id(
        &self,
        cmd: &str,
        args: Value,
        request_id: Option<Value>,
    ) -> Result<ControlResponse, ControlError> {
        let mut request = json!({"cmd": cmd, "args": args});
        if let Some(id) = request_id {
            request["request_id"] = id;
        }
        let mut line = serde_json::to_string(&request)
            .map_err(|e| ControlError::Io(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let response_line = self.exchange(&line)?;
        serde_json::from_str(response_line.trim())
            .map_err(|e| ControlError::InvalidResponse(e.to_string()))
    }

    #[cfg(unix)]
    fn exchange(&self, line: &str) -> Result<String, ControlError> {
        use std::io::{BufRead, BufReader, ErrorKind, Write};
        use std::os::unix::net::UnixStream;

        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|e| ControlError::Connect {
                path: self.socket_path.display().to_string(),
                reason: e.to_string(),
            })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| ControlError::Io(e.to_string()))?;

        stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| ControlError::Io(e.to_string()))?;

        let mut response = String::new();
        match BufReader::new(&stream).read_line(&mut response) {
            Ok(0) => Err(ControlError::InvalidResponse(
                "connection closed before a response".to_string(),
            )),
            Ok(_) => Ok(response),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(ControlError::Timeout(self.timeout))
            }
            Err(e) => Err(ControlError::Io(e.to_string())),
        }
    }

    #[cfg(not(unix))]
    fn exchange(&self, _line: &str) -> Result<String, ControlError> {
        Err(ControlError::Unsupported)
    }
}
