//! Handle to one running agent process.
//!
//! A handle exclusively owns the child process, the single thread reading its
//! stdout, and the receiving end of the bounded channel that thread feeds.
//! Everything else in the orchestrator talks to the agent through here.

use crate::error::SpawnError;
use crate::events::format_timestamp;
use crate::protocol::{
    AgentMessage, Health, OrchestratorCommand, decode_line, encode_command,
};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, ChildStdin, ExitStatus};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Capacity of each agent's inbound message channel.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Exit polling interval used while waiting for a process to stop.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Missed heartbeats tolerated before an agent is reported overdue.
const HEARTBEAT_GRACE_FACTOR: f64 = 3.0;

/// Lifecycle state of an agent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Spawned, no handshake yet.
    Starting,
    Running,
    ShuttingDown,
    /// Process has exited or was stopped.
    Inactive,
    /// Process exited unexpectedly.
    Error,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::ShuttingDown => "shutting_down",
            Lifecycle::Inactive => "inactive",
            Lifecycle::Error => "error",
        }
    }
}

/// Identity reported by the agent's handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
    pub agent_id: String,
    pub agent_version: String,
    pub protocol_version: String,
    pub capabilities: Option<Value>,
    pub received_at: DateTime<Utc>,
}

/// How a local `shutdown` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub exit_code: Option<i32>,
    /// The process had to be force-killed after the grace period.
    pub forced: bool,
}

/// Owner of one agent subprocess and its message channel.
#[derive(Debug)]
pub struct AgentHandle {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    rx: Receiver<AgentMessage>,
    reader: Option<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
    started_at: DateTime<Utc>,
    heartbeat_interval_s: f64,

    lifecycle: Lifecycle,
    health: Option<Health>,
    handshake: Option<HandshakeInfo>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_message: Option<Instant>,
    last_message_at: Option<DateTime<Utc>>,
    last_flush: Option<Instant>,
    last_error: Option<Value>,
    last_ack: Option<Value>,
    last_status: Option<Value>,
    messages_received: u64,
    heartbeat_overdue_reported: bool,
    /// Set once a stop was begun.
    kill_after: Option<Instant>,
    stop_forced: bool,
}

impl AgentHandle {
    /// Take ownership of a freshly spawned child and start its reader thread.
    ///
    /// The child must have been spawned with piped stdin and stdout.
    pub(crate) fn start(
        label: &str,
        mut child: Child,
        heartbeat_interval_s: f64,
    ) -> Result<Self, SpawnError> {
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::Launch {
                    label: label.to_string(),
                    reason: "stdio pipes were not captured".to_string(),
                });
            }
        };

        let (tx, rx) = channel::bounded(CHANNEL_CAPACITY);
        let reader_label = label.to_string();
        let reader = thread::Builder::new()
            .name(format!("drover-reader-{}", label))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                let mut buf = Vec::with_capacity(1024);
                loop {
                    buf.clear();
                    match stdout.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(agent = %reader_label, error = %e, "stdout read failed");
                            break;
                        }
                    }
                    let line = match std::str::from_utf8(&buf) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(agent = %reader_label, error = %e, "dropping non-utf8 line");
                            continue;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line(line.trim_end_matches(['\n', '\r'])) {
                        Ok(message) => {
                            // Blocks when the channel is full; the tick loop never does.
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(agent = %reader_label, error = %e, "dropping undecodable line");
                        }
                    }
                }
                trace!(agent = %reader_label, "reader thread finished");
            });

        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::Launch {
                    label: label.to_string(),
                    reason: format!("failed to start reader thread: {}", e),
                });
            }
        };

        Ok(Self {
            label: label.to_string(),
            child,
            stdin: Some(stdin),
            rx,
            reader: Some(reader),
            exit_status: None,
            started_at: Utc::now(),
            heartbeat_interval_s,
            lifecycle: Lifecycle::Starting,
            health: None,
            handshake: None,
            last_heartbeat: None,
            last_message: None,
            last_message_at: None,
            last_flush: None,
            last_error: None,
            last_ack: None,
            last_status: None,
            messages_received: 0,
            heartbeat_overdue_reported: false,
            kill_after: None,
            stop_forced: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
    }

    pub fn health(&self) -> Option<Health> {
        self.health
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.handshake.as_ref()
    }

    pub fn last_error(&self) -> Option<&Value> {
        self.last_error.as_ref()
    }

    pub fn last_ack(&self) -> Option<&Value> {
        self.last_ack.as_ref()
    }

    pub fn last_status(&self) -> Option<&Value> {
        self.last_status.as_ref()
    }

    /// Monotonic time of the last message observed from this agent.
    pub fn last_message(&self) -> Option<Instant> {
        self.last_message
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Write one command line to the agent's stdin.
    ///
    /// Returns `false` when the process or its pipe is gone; never errors.
    pub fn send_command(&mut self, command: &OrchestratorCommand) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        let line = encode_command(command);
        match stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => {
                trace!(agent = %self.label, cmd = %command.kind, "sent command");
                true
            }
            Err(e) => {
                debug!(agent = %self.label, cmd = %command.kind, error = %e, "command not delivered");
                self.stdin = None;
                false
            }
        }
    }

    /// Wait up to `timeout` for the next message.
    pub fn read_message(&self, timeout: Duration) -> Option<AgentMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_read_message(&self) -> Option<AgentMessage> {
        self.rx.try_recv().ok()
    }

    /// Take up to `max` queued messages without blocking.
    pub fn drain(&self, max: usize) -> Vec<AgentMessage> {
        self.rx.try_iter().take(max).collect()
    }

    /// True once the reader has finished and every queued message was taken.
    pub fn is_drained(&self) -> bool {
        self.rx.is_empty() && self.reader.as_ref().is_none_or(|r| r.is_finished())
    }

    /// Whether the OS process is still running. The exit status is cached.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(agent = %self.label, error = %e, "failed to poll process status");
                false
            }
        }
    }

    /// Exit code, once the process has been observed to exit.
    ///
    /// `None` while running or when terminated by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|s| s.code())
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Ask the agent to stop, wait up to `grace`, then force-kill.
    pub fn shutdown(&mut self, grace: Duration) -> StopOutcome {
        self.begin_stop(grace);
        self.complete_stop()
    }

    /// Send `shutdown`, close stdin and arm the kill deadline. Never waits.
    ///
    /// Returns false when the process had already exited.
    pub fn begin_stop(&mut self, grace: Duration) -> bool {
        let now = Instant::now();
        if !self.is_alive() {
            self.kill_after = Some(now);
            self.lifecycle = Lifecycle::ShuttingDown;
            return false;
        }

        self.lifecycle = Lifecycle::ShuttingDown;
        self.send_command(&OrchestratorCommand::shutdown());
        // Closing stdin lets agents that read until EOF notice too.
        self.stdin = None;
        self.kill_after = Some(now + grace);
        true
    }

    /// Whether a stop was begun and its grace period has run out.
    pub fn stop_overdue(&self, now: Instant) -> bool {
        self.kill_after.is_some_and(|deadline| now >= deadline)
    }

    /// Advance a begun stop without blocking.
    ///
    /// Kills the process once the grace period is over. Returns the outcome
    /// once the process is gone, `None` while it is still winding down.
    pub fn poll_stop(&mut self, now: Instant) -> Option<StopOutcome> {
        if self.is_alive() {
            if !self.stop_overdue(now) {
                return None;
            }
            warn!(agent = %self.label, "agent ignored shutdown, killing");
            self.kill();
            self.stop_forced = true;
        }
        self.finish(Lifecycle::Inactive);
        Some(StopOutcome {
            exit_code: self.exit_code(),
            forced: self.stop_forced,
        })
    }

    /// Wait out a begun stop, force-killing at the deadline.
    pub fn complete_stop(&mut self) -> StopOutcome {
        let remaining = self
            .kill_after
            .map_or(Duration::ZERO, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
        self.wait_with_timeout(remaining);
        let outcome = self.poll_stop(Instant::now());
        outcome.unwrap_or(StopOutcome {
            exit_code: self.exit_code(),
            forced: self.stop_forced,
        })
    }

    /// Force-kill and reap the process.
    pub fn kill(&mut self) {
        if self.exit_status.is_none() {
            // On Unix this is SIGKILL.
            let _ = self.child.kill();
            match self.child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => warn!(agent = %self.label, error = %e, "failed to reap killed agent"),
            }
        }
        self.stdin = None;
        self.lifecycle = Lifecycle::Inactive;
    }

    /// Poll for exit every 100ms until `timeout`. Returns true if it exited.
    fn wait_with_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_alive() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    fn finish(&mut self, lifecycle: Lifecycle) {
        self.stdin = None;
        self.lifecycle = lifecycle;
        if self.reader.as_ref().is_some_and(|r| r.is_finished())
            && let Some(reader) = self.reader.take()
        {
            let _ = reader.join();
        }
    }

    /// Update bookkeeping from one received message.
    pub fn observe(&mut self, message: &AgentMessage) {
        let now = Utc::now();
        let envelope = message.envelope();

        self.messages_received += 1;
        self.last_message = Some(Instant::now());
        self.last_message_at = Some(now);
        if let Some(health) = envelope.health {
            self.health = Some(health);
        }

        match message {
            AgentMessage::Handshake(env) => {
                self.handshake = Some(HandshakeInfo {
                    agent_id: env.agent_id.clone(),
                    agent_version: env.agent_version.clone(),
                    protocol_version: env.protocol_version.clone(),
                    capabilities: env.data.get("capabilities").cloned(),
                    received_at: now,
                });
                if self.lifecycle == Lifecycle::Starting {
                    self.lifecycle = Lifecycle::Running;
                }
            }
            AgentMessage::Heartbeat(_) => {
                self.last_heartbeat = Some(now);
                self.heartbeat_overdue_reported = false;
                if self.lifecycle == Lifecycle::Starting {
                    self.lifecycle = Lifecycle::Running;
                }
            }
            AgentMessage::Error(env) => {
                self.last_error = Some(diagnostic(env.message.as_deref(), &env.data, now));
            }
            AgentMessage::Ack(env) => {
                self.last_ack = Some(diagnostic(env.message.as_deref(), &env.data, now));
            }
            AgentMessage::Status(env) => {
                self.last_status = Some(diagnostic(env.message.as_deref(), &env.data, now));
            }
            AgentMessage::Summary(_) | AgentMessage::Log(_) | AgentMessage::Other { .. } => {}
        }
    }

    /// Whether a flush is due, given the effective interval.
    pub fn flush_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_flush
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    pub fn record_flush(&mut self, now: Instant) {
        self.last_flush = Some(now);
    }

    /// Returns true the first time the heartbeat is overdue since the last one.
    pub fn take_heartbeat_overdue(&mut self, now: DateTime<Utc>) -> bool {
        if self.heartbeat_overdue_reported || self.lifecycle != Lifecycle::Running {
            return false;
        }
        let Some(last) = self.last_heartbeat.or(self.last_message_at) else {
            return false;
        };
        let age = (now - last).num_milliseconds() as f64 / 1000.0;
        if age > self.heartbeat_interval_s * HEARTBEAT_GRACE_FACTOR {
            self.heartbeat_overdue_reported = true;
            return true;
        }
        false
    }

    /// JSON view for the control plane.
    pub fn snapshot(&self) -> Value {
        let now = Utc::now();
        let age = |ts: Option<DateTime<Utc>>| {
            ts.map(|t| (now - t).num_milliseconds() as f64 / 1000.0)
        };

        json!({
            "label": self.label,
            "pid": self.pid(),
            "lifecycle": self.lifecycle.as_str(),
            "alive": self.exit_status.is_none(),
            "exit_code": self.exit_code(),
            "health": self.health.map(|h| h.as_str()),
            "started_at": format_timestamp(&self.started_at),
            "last_heartbeat_age_s": age(self.last_heartbeat),
            "last_message_age_s": age(self.last_message_at),
            "agent_id": self.handshake.as_ref().map(|h| h.agent_id.clone()),
            "agent_version": self.handshake.as_ref().map(|h| h.agent_version.clone()),
            "protocol_version": self.handshake.as_ref().map(|h| h.protocol_version.clone()),
            "messages_received": self.messages_received,
            "last_error": self.last_error,
            "last_ack": self.last_ack,
            "last_status": self.last_status,
        })
    }
}

fn diagnostic(
    message: Option<&str>,
    data: &serde_json::Map<String, Value>,
    at: DateTime<Utc>,
) -> Value {
    json!({
        "message": message,
        "data": data,
        "at": format_timestamp(&at),
    })
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            if let Ok(None) = self.child.try_wait() {
                debug!(agent = %self.label, "killing agent on handle drop");
            }
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
