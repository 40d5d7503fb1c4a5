//! Shared fixtures for tests that spawn real agent processes.
//!
//! Agents are small POSIX `sh` scripts launched through the `sh` interpreter,
//! so no file needs the executable bit.

use crate::config::{AgentConfig, Config};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Shell helpers prepended to every test agent.
const PRELUDE: &str = r#"
ts() { date -u +%Y-%m-%dT%H:%M:%SZ; }
emit() {
  printf '{"type":"%s","timestamp":"%s","agent_id":"%s-1","agent_label":"%s","agent_version":"1.0","data":%s}\n' \
    "$1" "$(ts)" "$DROVER_AGENT_LABEL" "$DROVER_AGENT_LABEL" "$2"
}
"#;

/// Handshakes, answers `flush` with a summary and the shutdown sequence with
/// every ack.
pub(crate) const COOPERATIVE_AGENT: &str = r#"
emit handshake '{"capabilities":["flush","sequence"]}'
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"sequence"'*)
      emit ack '{"command":"stop"}'
      emit ack '{"command":"flush"}'
      emit summary '{"final":true}'
      emit ack '{"command":"shutdown"}'
      exit 0
      ;;
    *'"cmd":"flush"'*) emit summary '{"count":1}' ;;
    *'"cmd":"status"'*) emit status '{"state":"ok"}' ;;
    *'"cmd":"shutdown"'*) emit ack '{"command":"shutdown"}'; exit 0 ;;
  esac
done
"#;

/// Acks `stop` and `flush` of the shutdown sequence, then goes quiet.
pub(crate) const PARTIAL_AGENT: &str = r#"
emit handshake '{}'
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"sequence"'*)
      emit ack '{"command":"stop"}'
      emit ack '{"command":"flush"}'
      ;;
  esac
done
while :; do sleep 1; done
"#;

/// Handshakes, then ignores everything, including stdin EOF.
pub(crate) const STUBBORN_AGENT: &str = r#"
emit handshake '{}'
while :; do sleep 1; done
"#;

/// Handshakes and exits with status 3.
pub(crate) const CRASHING_AGENT: &str = r#"
emit handshake '{}'
exit 3
"#;

/// Prints one undecodable line before a valid heartbeat.
pub(crate) const NOISY_AGENT: &str = r#"
echo 'this is not json'
echo '{"type":"heartbeat"}'
emit heartbeat '{}'
echo 'boom' >&2
while IFS= read -r line; do :; done
"#;

/// A scratch directory laid out like a drover installation.
pub(crate) struct TestWorkspace {
    pub dir: TempDir,
    pub config: Config,
}

impl TestWorkspace {
    pub(crate) fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins")).unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        let mut config = Config::load_or_default(dir.path().join("drover.yaml")).unwrap();
        config.cooldown_seconds = 1.0;
        config.poll_tick_s = 0.05;
        config.shutdown_timeout_s = 2.0;
        config.drain_timeout_s = 0.2;
        Self { dir, config }
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `plugins/<name>/agent.sh` and return its relative entry point.
    pub(crate) fn write_agent(&self, name: &str, body: &str) -> String {
        let dir = self.path().join("plugins").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("agent.sh"), format!("#!/bin/sh\n{}{}", PRELUDE, body)).unwrap();
        format!("{}/agent.sh", name)
    }

    /// Write an agent script and register it under `label`.
    pub(crate) fn add_agent(&mut self, label: &str, body: &str) -> AgentConfig {
        let executable = self.write_agent(label, body);
        let agent = AgentConfig {
            executable,
            interpreter: Some("sh".to_string()),
            heartbeat_interval_s: 1.0,
            agent_flush_interval_s: 0.05,
            ..Default::default()
        };
        self.config.agents.insert(label.to_string(), agent.clone());
        agent
    }

    /// Write `templates/<id>/template.yaml` plus its agent script.
    pub(crate) fn write_template(&self, id: &str, manifest: &str, body: &str) -> PathBuf {
        let dir = self.path().join("templates").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("agent.sh"), format!("#!/bin/sh\n{}{}", PRELUDE, body)).unwrap();
        std::fs::write(dir.join("template.yaml"), manifest).unwrap();
        dir
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
