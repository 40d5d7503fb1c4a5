//! Spawning agent processes.

use super::handle::AgentHandle;
use super::resolve::resolve_entry_point;
use crate::config::{AgentConfig, Config, is_valid_label};
use crate::error::SpawnError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

/// Environment variable carrying the agent's configured label.
pub const LABEL_ENV: &str = "DROVER_AGENT_LABEL";

/// Launches agents from the trusted roots with captured stdio.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    plugins_root: PathBuf,
    templates_root: PathBuf,
    logs_dir: PathBuf,
}

impl ProcessManager {
    pub fn new(plugins_root: PathBuf, templates_root: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            plugins_root,
            templates_root,
            logs_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.plugins_root(),
            config.templates_root(),
            config.logs_dir(),
        )
    }

    /// Trusted roots in search order.
    pub fn roots(&self) -> Vec<PathBuf> {
        vec![self.plugins_root.clone(), self.templates_root.clone()]
    }

    pub fn stderr_log_path(&self, label: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.stderr.log", label))
    }

    /// Resolve, launch, and wrap one agent.
    pub fn spawn(&self, label: &str, agent: &AgentConfig) -> Result<AgentHandle, SpawnError> {
        if !is_valid_label(label) {
            return Err(SpawnError::InvalidCommand {
                label: label.to_string(),
                reason: "invalid label".to_string(),
            });
        }

        let entry = resolve_entry_point(&agent.executable, &self.roots())?;
        let mut command = build_command(label, agent, &entry)?;

        let stderr_path = self.stderr_log_path(label);
        let stderr = open_stderr_log(&stderr_path).map_err(|e| SpawnError::Launch {
            label: label.to_string(),
            reason: format!("failed to open '{}': {}", stderr_path.display(), e),
        })?;

        command
            .args(&agent.args)
            .env(LABEL_ENV, label)
            .env("DROVER_HEARTBEAT_INTERVAL_S", agent.heartbeat_interval_s.to_string())
            .env("DROVER_FLUSH_INTERVAL_S", agent.agent_flush_interval_s.to_string())
            .envs(&agent.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr));
        if let Some(dir) = entry.parent() {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| SpawnError::Launch {
            label: label.to_string(),
            reason: format!("{}: {}", entry.display(), e),
        })?;

        info!(agent = %label, pid = child.id(), entry = %entry.display(), "agent spawned");
        AgentHandle::start(label, child, agent.heartbeat_interval_s)
    }
}

/// `<interpreter words...> <entry>` or just `<entry>`.
fn build_command(label: &str, agent: &AgentConfig, entry: &Path) -> Result<Command, SpawnError> {
    let Some(interpreter) = agent
        .interpreter
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(Command::new(entry));
    };

    let words = shell_words::split(interpreter).map_err(|e| SpawnError::InvalidCommand {
        label: label.to_string(),
        reason: format!("failed to parse interpreter '{}': {}", interpreter, e),
    })?;
    let Some((program, rest)) = words.split_first() else {
        return Err(SpawnError::InvalidCommand {
            label: label.to_string(),
            reason: "interpreter is empty after parsing".to_string(),
        });
    };

    let mut command = Command::new(program);
    command.args(rest).arg(entry);
    Ok(command)
}

fn open_stderr_log(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::Lifecycle;
    use crate::protocol::{AgentMessage, CommandKind, OrchestratorCommand};
    use crate::test_support::{
        COOPERATIVE_AGENT, CRASHING_AGENT, NOISY_AGENT, STUBBORN_AGENT, TestWorkspace, wait_until,
    };
    use serial_test::serial;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    #[serial]
    fn handshake_marks_agent_running() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("keys", COOPERATIVE_AGENT);
        let manager = ProcessManager::from_config(&ws.config);

        let mut handle = manager.spawn("keys", &agent).unwrap();
        assert_eq!(handle.lifecycle(), Lifecycle::Starting);
        assert!(handle.is_alive());

        let message = handle.read_message(WAIT).unwrap();
        assert!(matches!(message, AgentMessage::Handshake(_)));
        handle.observe(&message);
        assert_eq!(handle.lifecycle(), Lifecycle::Running);

        let handshake = handle.handshake().unwrap();
        assert_eq!(handshake.agent_id, "keys-1");
        assert_eq!(handshake.agent_version, "1.0");
        assert_eq!(handle.snapshot()["agent_id"], "keys-1");
    }

    #[test]
    #[serial]
    fn flush_command_yields_a_summary() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("keys", COOPERATIVE_AGENT);
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("keys", &agent)
            .unwrap();
        handle.read_message(WAIT).unwrap();

        assert!(handle.send_command(&OrchestratorCommand::flush()));
        let summary = handle.read_message(WAIT).unwrap();
        assert!(matches!(summary, AgentMessage::Summary(_)));
        assert_eq!(summary.envelope().data["count"], 1);
    }

    #[test]
    #[serial]
    fn shutdown_exits_cleanly() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("keys", COOPERATIVE_AGENT);
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("keys", &agent)
            .unwrap();

        let outcome = handle.shutdown(WAIT);
        assert!(!outcome.forced);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(handle.lifecycle(), Lifecycle::Inactive);
        assert!(!handle.is_alive());
        assert!(!handle.send_command(&OrchestratorCommand::flush()));

        let acked: Vec<Option<CommandKind>> =
            std::iter::from_fn(|| handle.read_message(Duration::from_millis(500)))
                .map(|m| m.acked_command())
                .collect();
        assert!(acked.contains(&Some(CommandKind::Shutdown)));
    }

    #[test]
    #[serial]
    fn stubborn_agent_is_force_killed_after_grace() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("stubborn", STUBBORN_AGENT);
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("stubborn", &agent)
            .unwrap();
        handle.read_message(WAIT).unwrap();

        let outcome = handle.shutdown(Duration::from_millis(300));
        assert!(outcome.forced);
        assert!(!handle.is_alive());
    }

    #[test]
    #[serial]
    fn begun_stop_is_polled_to_a_kill_without_waiting() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("stubborn", STUBBORN_AGENT);
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("stubborn", &agent)
            .unwrap();
        handle.read_message(WAIT).unwrap();

        let started = Instant::now();
        assert!(handle.begin_stop(Duration::from_millis(300)));
        assert_eq!(handle.lifecycle(), Lifecycle::ShuttingDown);
        assert_eq!(handle.poll_stop(Instant::now()), None);
        assert!(started.elapsed() < Duration::from_millis(300));

        let outcome = handle.poll_stop(started + Duration::from_millis(300)).unwrap();
        assert!(outcome.forced);
        assert!(!handle.is_alive());
        assert_eq!(handle.lifecycle(), Lifecycle::Inactive);
    }

    #[test]
    #[serial]
    fn exit_is_observed_with_code() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("crashy", CRASHING_AGENT);
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("crashy", &agent)
            .unwrap();

        assert!(wait_until(WAIT, || !handle.is_alive()));
        assert_eq!(handle.exit_code(), Some(3));
        assert!(wait_until(WAIT, || {
            let _ = handle.drain(256);
            handle.is_drained()
        }));
        assert!(!handle.send_command(&OrchestratorCommand::flush()));
    }

    #[test]
    #[serial]
    fn undecodable_lines_are_skipped_and_stderr_is_logged() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent("noisy", NOISY_AGENT);
        let manager = ProcessManager::from_config(&ws.config);
        let mut handle = manager.spawn("noisy", &agent).unwrap();

        let message = handle.read_message(WAIT).unwrap();
        assert!(matches!(message, AgentMessage::Heartbeat(_)));
        handle.observe(&message);
        assert_eq!(handle.messages_received(), 1);

        let log = manager.stderr_log_path("noisy");
        assert!(wait_until(WAIT, || {
            std::fs::read_to_string(&log).is_ok_and(|s| s.contains("boom"))
        }));
        handle.kill();
        assert!(!handle.is_alive());
    }

    #[test]
    #[serial]
    fn non_utf8_line_does_not_stop_the_reader() {
        let mut ws = TestWorkspace::new();
        let agent = ws.add_agent(
            "binary",
            r#"printf '\377\376 garbage\n'
emit heartbeat '{}'
while IFS= read -r line; do :; done
"#,
        );
        let mut handle = ProcessManager::from_config(&ws.config)
            .spawn("binary", &agent)
            .unwrap();

        let message = handle.read_message(WAIT).unwrap();
        assert!(matches!(message, AgentMessage::Heartbeat(_)));
        handle.kill();
    }

    #[test]
    #[serial]
    fn per_agent_env_and_args_are_passed() {
        let mut ws = TestWorkspace::new();
        let mut agent = ws.add_agent(
            "envy",
            r#"emit status "{\"mode\":\"$MODE\",\"arg\":\"$1\"}"
while IFS= read -r line; do :; done
"#,
        );
        agent.env.insert("MODE".to_string(), "fast".to_string());
        agent.args = vec!["--first".to_string()];
        let handle = ProcessManager::from_config(&ws.config)
            .spawn("envy", &agent)
            .unwrap();

        let status = handle.read_message(WAIT).unwrap();
        assert_eq!(status.envelope().data["mode"], "fast");
        assert_eq!(status.envelope().data["arg"], "--first");
    }

    #[test]
    fn spawn_rejects_traversal_and_bad_interpreter() {
        let mut ws = TestWorkspace::new();
        let manager = ProcessManager::from_config(&ws.config);

        let mut agent = ws.add_agent("keys", COOPERATIVE_AGENT);
        agent.executable = "../keys/agent.sh".to_string();
        assert!(matches!(
            manager.spawn("keys", &agent),
            Err(SpawnError::Traversal(_))
        ));

        let mut agent = ws.add_agent("keys", COOPERATIVE_AGENT);
        agent.interpreter = Some("sh \"unterminated".to_string());
        assert!(matches!(
            manager.spawn("keys", &agent),
            Err(SpawnError::InvalidCommand { .. })
        ));

        assert!(matches!(
            manager.spawn("bad label", &agent),
            Err(SpawnError::InvalidCommand { .. })
        ));
    }
}
