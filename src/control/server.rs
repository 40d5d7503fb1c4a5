//! Unix-socket control server.
//!
//! The accept loop runs on its own thread and polls a non-blocking listener
//! so it notices a halt promptly. Each connection gets a thread that reads
//! one JSON request per line and writes one response per line. Requests that
//! touch orchestrator state are forwarded to the tick loop over a channel and
//! answered through a per-request reply channel.

use super::request::{ControlReply, ControlRequest, RequestLine};
use super::response::ControlResponse;
use crate::config::types::MAX_SOCKET_PATH_LEN;
use crate::error::ControlError;
use crate::signals::StopSignal;
use crossbeam::channel::{self, Receiver, Sender};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Accept and read poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a connection waits for the tick loop to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest request line accepted, excluding the newline.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Pending requests the tick loop has not picked up yet.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// A running control server. Dropping it stops the server.
pub struct ControlServer {
    socket_path: PathBuf,
    halt: StopSignal,
    accept_thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `socket_path` and start accepting.
    ///
    /// `orchestrator_stop` is tripped by `control_orchestrator{action: stop}`.
    /// The returned receiver yields every request the tick loop must answer.
    pub fn start(
        socket_path: &Path,
        orchestrator_stop: StopSignal,
    ) -> Result<(Self, Receiver<ControlRequest>), ControlError> {
        let len = socket_path.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(ControlError::PathTooLong {
                path: socket_path.display().to_string(),
                len,
                max: MAX_SOCKET_PATH_LEN,
            });
        }

        let listener = imp::bind(socket_path)?;
        let (tx, rx) = channel::bounded(REQUEST_QUEUE_CAPACITY);
        let halt = StopSignal::new();

        let context = ConnectionContext {
            requests: tx,
            orchestrator_stop,
            halt: halt.clone(),
        };
        let accept_thread = std::thread::Builder::new()
            .name("drover-control".to_string())
            .spawn(move || imp::accept_loop(listener, context))
            .map_err(|e| ControlError::Bind {
                path: socket_path.display().to_string(),
                reason: format!("failed to start accept thread: {}", e),
            })?;

        info!(socket = %socket_path.display(), "control plane listening");
        Ok((
            Self {
                socket_path: socket_path.to_path_buf(),
                halt,
                accept_thread: Some(accept_thread),
            },
            rx,
        ))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, wait for the accept thread, and remove the socket.
    pub fn stop(&mut self) {
        let Some(thread) = self.accept_thread.take() else {
            return;
        };
        self.halt.request_stop();
        if thread.join().is_err() {
            error!("control accept thread panicked");
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(socket = %self.socket_path.display(), error = %e, "failed to remove control socket");
        }
        info!("control plane stopped");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State shared by every connection thread.
#[derive(Clone)]
struct ConnectionContext {
    requests: Sender<ControlRequest>,
    orchestrator_stop: StopSignal,
    halt: StopSignal,
}

impl ConnectionContext {
    /// Answer one request line.
    fn handle_line(&self, line: &str) -> ControlResponse {
        let request = match RequestLine::parse(line) {
            Ok(request) => request,
            Err((error, request_id)) => {
                return ControlResponse::failure("", error).with_request_id(request_id.as_ref());
            }
        };
        debug!(cmd = %request.cmd, "control request");

        let response = match request.cmd.as_str() {
            "ping" => ControlResponse::success("ping", json!({"pong": true})),
            "control_orchestrator" if request.arg_str("action") == Some("stop") => {
                info!("stop requested over control plane");
                self.orchestrator_stop.request_stop();
                ControlResponse::success(&request.cmd, json!({"stopping": true}))
            }
            _ => self.forward(&request),
        };
        response.with_request_id(request.request_id.as_ref())
    }

    fn forward(&self, request: &RequestLine) -> ControlResponse {
        let (reply_tx, reply_rx) = channel::bounded::<ControlReply>(1);
        let forwarded =
            ControlRequest::new(request.cmd.clone(), request.args.clone(), reply_tx);

        if self.requests.send_timeout(forwarded, REPLY_TIMEOUT).is_err() {
            return ControlResponse::failure(&request.cmd, "orchestrator did not respond");
        }
        match reply_rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(result) => ControlResponse::from_result(&request.cmd, result),
            Err(_) => ControlResponse::failure(&request.cmd, "orchestrator did not respond"),
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::{ConnectionContext, ControlResponse, MAX_REQUEST_LINE, POLL_INTERVAL};
    use crate::error::ControlError;
    use std::fs;
    use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::Path;
    use tracing::{debug, warn};

    pub(super) fn bind(socket_path: &Path) -> Result<UnixListener, ControlError> {
        let bind_error = |reason: String| ControlError::Bind {
            path: socket_path.display().to_string(),
            reason,
        };

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| bind_error(e.to_string()))?;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }

        // A socket file left behind by a dead instance.
        if fs::symlink_metadata(socket_path).is_ok() {
            fs::remove_file(socket_path)
                .map_err(|e| bind_error(format!("failed to remove stale socket: {}", e)))?;
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| bind_error(e.to_string()))?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| bind_error(format!("failed to restrict permissions: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_error(e.to_string()))?;
        Ok(listener)
    }

    pub(super) fn accept_loop(listener: UnixListener, context: ConnectionContext) {
        let mut connection_id: u64 = 0;
        while !context.halt.is_stop_requested() {
            match listener.accept() {
                Ok((stream, _)) => {
                    connection_id += 1;
                    let context = context.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("drover-control-{}", connection_id))
                        .spawn(move || {
                            if let Err(e) = serve_connection(stream, &context) {
                                debug!(error = %e, "control connection ended with error");
                            }
                        });
                    if let Err(e) = spawned {
                        warn!(error = %e, "failed to start control connection thread");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn serve_connection(stream: UnixStream, context: &ConnectionContext) -> std::io::Result<()> {
        // Accepted sockets inherit O_NONBLOCK on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();

        loop {
            if context.halt.is_stop_requested() {
                return Ok(());
            }
            let budget = (MAX_REQUEST_LINE + 1).saturating_sub(buffer.len()) as u64;
            match reader.by_ref().take(budget).read_until(b'\n', &mut buffer) {
                Ok(0) => return Ok(()),
                Ok(_) if buffer.len() > MAX_REQUEST_LINE && !buffer.ends_with(b"\n") => {
                    warn!(bytes = buffer.len(), "control request line too long, closing connection");
                    let response = ControlResponse::failure(
                        "",
                        format!("request line exceeds {} bytes", MAX_REQUEST_LINE),
                    );
                    writer.write_all(response.to_line().as_bytes())?;
                    writer.flush()?;
                    return Ok(());
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = context.handle_line(&line);
                    writer.write_all(response.to_line().as_bytes())?;
                    writer.flush()?;
                }
                // Partial input stays in `buffer` across timeouts.
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::ConnectionContext;
    use crate::error::ControlError;
    use std::path::Path;

    pub(super) struct Unsupported;

    pub(super) fn bind(_socket_path: &Path) -> Result<Unsupported, ControlError> {
        Err(ControlError::Unsupported)
    }

    pub(super) fn accept_loop(_listener: Unsupported, _context: ConnectionContext) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::control::ControlClient;
    use serial_test::serial;
    use tempfile::TempDir;

    /// Answers forwarded requests the way the tick loop would for two commands.
    fn spawn_responder(rx: Receiver<ControlRequest>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while let Ok(request) = rx.recv() {
                let reply = match request.cmd.as_str() {
                    "get_monitor_settings" => Ok(json!({"cooldown_seconds": 10.0})),
                    other => Err(format!("unknown command '{}'", other)),
                };
                request.respond(reply);
            }
        })
    }

    #[test]
    #[serial]
    fn ping_is_answered_and_request_id_echoed() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("run").join("control.sock");
        let (mut server, _rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();

        let client = ControlClient::new(&socket);
        let response = client
            .request_with_id("ping", json!({}), Some(json!("req-42")))
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.cmd, "ping");
        assert_eq!(response.data, Some(json!({"pong": true})));
        assert_eq!(response.request_id, Some(json!("req-42")));

        server.stop();
        assert!(!socket.exists());
    }

    #[test]
    #[serial]
    fn socket_and_directory_permissions_are_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("state").join("control.sock");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, "stale").unwrap();

        let (_server, _rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&socket), 0o600);
        assert_eq!(mode(socket.parent().unwrap()), 0o700);
    }

    #[test]
    #[serial]
    fn forwarded_requests_get_replies_and_unknown_commands_fail() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");
        let (_server, rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();
        let _responder = spawn_responder(rx);
        let client = ControlClient::new(&socket);

        let settings = client.request("get_monitor_settings", json!({})).unwrap();
        assert!(settings.ok);
        assert_eq!(settings.data.unwrap()["cooldown_seconds"], 10.0);

        let unknown = client.request("frobnicate", json!({})).unwrap();
        assert!(!unknown.ok);
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'frobnicate'"));
    }

    #[test]
    #[serial]
    fn stop_action_trips_the_orchestrator_signal() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");
        let stop = StopSignal::new();
        let (_server, _rx) = ControlServer::start(&socket, stop.clone()).unwrap();

        let response = ControlClient::new(&socket)
            .request("control_orchestrator", json!({"action": "stop"}))
            .unwrap();
        assert!(response.ok);
        assert!(stop.is_stop_requested());
    }

    #[test]
    #[serial]
    fn malformed_lines_get_an_error_response() {
        use std::io::{BufRead, BufReader, Write};
        use std::os::unix::net::UnixStream;

        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");
        let (_server, _rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();

        let mut stream = UnixStream::connect(&socket).unwrap();
        stream.write_all(b"{nope\n").unwrap();
        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line).unwrap();

        let response: ControlResponse = serde_json::from_str(&line).unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("invalid request JSON"));
    }

    #[test]
    #[serial]
    fn overlong_request_lines_are_refused() {
        use std::io::{BufRead, BufReader, Write};
        use std::os::unix::net::UnixStream;

        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");
        let (_server, _rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();

        let mut stream = UnixStream::connect(&socket).unwrap();
        stream.write_all(&vec![b'x'; MAX_REQUEST_LINE + 16]).unwrap();
        let mut line = String::new();
        let mut reader = BufReader::new(&stream);
        reader.read_line(&mut line).unwrap();

        let response: ControlResponse = serde_json::from_str(&line).unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("exceeds"));

        // The server closed the connection.
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    #[serial]
    fn unanswered_requests_time_out() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");
        let (_server, _rx) = ControlServer::start(&socket, StopSignal::new()).unwrap();

        let response = ControlClient::new(&socket)
            .request("get_agent_states", json!({}))
            .unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("orchestrator did not respond"));
    }

    #[test]
    fn overlong_socket_paths_are_rejected() {
        let long = PathBuf::from(format!("/tmp/{}/control.sock", "d".repeat(120)));
        assert!(matches!(
            ControlServer::start(&long, StopSignal::new()),
            Err(ControlError::PathTooLong { .. })
        ));
    }
}
