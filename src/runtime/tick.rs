//! One tick of the runtime loop.
//!
//! Stages run in a fixed order: control requests, reaping, in-process
//! plugins, live agents, telemetry. Nothing here blocks on an agent; the only
//! waits are the bounded drains of a process that already exited. Agents
//! being stopped are advanced a step per tick and killed at their deadline.

use super::orchestrator::Orchestrator;
use super::state::SegmentPipeline;
use super::telemetry::{Stage, TickSample};
use crate::agent::Lifecycle;
use crate::config::AgentLogLevel;
use crate::events::Event;
use crate::logging::AGENT_TARGET;
use crate::protocol::{AgentMessage, Envelope, OrchestratorCommand};
use chrono::Utc;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Most messages taken from one agent per tick.
pub const MAX_DRAIN_PER_TICK: usize = 256;

/// How long reaping waits for an exited agent's reader to finish.
const REAP_DRAIN_WINDOW: Duration = Duration::from_millis(100);

impl Orchestrator {
    /// Run every stage once and record telemetry.
    pub fn tick(&mut self) {
        let tick_started = Instant::now();
        let mut sample = TickSample::default();
        self.state.tick_count += 1;

        let started = Instant::now();
        self.handle_control_requests();
        sample.record_stage(Stage::Control, started.elapsed());

        let started = Instant::now();
        self.reap_exited_agents(&mut sample);
        self.advance_stopping_agents(&mut sample);
        sample.record_stage(Stage::Reap, started.elapsed());

        let started = Instant::now();
        let now = Utc::now();
        self.pipeline.poll_plugins(now);
        self.pipeline.close_if_expired(now);
        sample.record_stage(Stage::Plugins, started.elapsed());

        let started = Instant::now();
        self.service_agents(&mut sample);
        sample.record_stage(Stage::Agents, started.elapsed());

        let started = Instant::now();
        self.check_heartbeats();
        sample.record_stage(Stage::Telemetry, started.elapsed());

        sample.duration = tick_started.elapsed();
        self.telemetry.record(sample);
    }

    /// Remove handles whose process exited outside a requested stop.
    fn reap_exited_agents(&mut self, sample: &mut TickSample) {
        let exited: Vec<String> = self
            .state
            .agents
            .iter_mut()
            .filter_map(|(label, handle)| (!handle.is_alive()).then(|| label.clone()))
            .collect();

        for label in exited {
            let Some(mut handle) = self.state.agents.remove(&label) else {
                continue;
            };
            let level = self.config.agent_log_level;
            let deadline = Instant::now() + REAP_DRAIN_WINDOW;
            loop {
                for message in handle.drain(MAX_DRAIN_PER_TICK) {
                    sample.count_message(message.type_name());
                    handle.observe(&message);
                    route_message(&label, &message, &mut self.pipeline, level);
                }
                if handle.is_drained() || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }

            let exit_code = handle.exit_code();
            handle.set_lifecycle(if exit_code == Some(0) {
                Lifecycle::Inactive
            } else {
                Lifecycle::Error
            });
            warn!(agent = %label, pid = handle.pid(), exit_code = ?exit_code, "agent exited unexpectedly");

            let event = Event::new(label.as_str(), "agent_exited").with_payload(json!({
                "pid": handle.pid(),
                "exit_code": exit_code,
                "messages_received": handle.messages_received(),
                "last_error": handle.last_error(),
            }));
            self.pipeline.write_event(&event);
            self.state.agents_reaped += 1;
        }
    }

    /// Route what stopping agents sent, then retire those that are gone.
    ///
    /// A handle is retired once its process exited and its channel is empty,
    /// or once the kill deadline passed. Deferred starts spawn afterwards.
    fn advance_stopping_agents(&mut self, sample: &mut TickSample) {
        let now = Instant::now();
        let level = self.config.agent_log_level;
        let mut retired = Vec::new();

        for (label, handle) in self.state.stopping.iter_mut() {
            for message in handle.drain(MAX_DRAIN_PER_TICK) {
                sample.count_message(message.type_name());
                handle.observe(&message);
                route_message(label, &message, &mut self.pipeline, level);
            }
            if let Some(outcome) = handle.poll_stop(now)
                && (handle.is_drained() || handle.stop_overdue(now))
            {
                retired.push((label.clone(), outcome));
            }
        }

        for (label, outcome) in retired {
            if let Some(handle) = self.state.stopping.remove(&label) {
                for message in handle.drain(MAX_DRAIN_PER_TICK) {
                    route_message(&label, &message, &mut self.pipeline, level);
                }
            }
            info!(
                agent = %label,
                exit_code = ?outcome.exit_code,
                forced = outcome.forced,
                "agent stopped"
            );
            if self.state.respawn.remove(&label) {
                self.spawn_agent(&label);
            }
        }
    }

    /// Wait out every stop still in progress, killing at each deadline.
    pub(super) fn finish_stopping_agents(&mut self) {
        let level = self.config.agent_log_level;
        self.state.respawn.clear();
        for (label, mut handle) in std::mem::take(&mut self.state.stopping) {
            let outcome = handle.complete_stop();
            for message in handle.drain(MAX_DRAIN_PER_TICK) {
                handle.observe(&message);
                route_message(&label, &message, &mut self.pipeline, level);
            }
            info!(
                agent = %label,
                exit_code = ?outcome.exit_code,
                forced = outcome.forced,
                "agent stopped"
            );
        }
    }

    /// Stage 4: flush requests, then drain and route each agent's messages.
    fn service_agents(&mut self, sample: &mut TickSample) {
        let now = Instant::now();
        let poll_tick = self.config.poll_tick_s;
        let level = self.config.agent_log_level;

        for (label, handle) in self.state.agents.iter_mut() {
            if handle.lifecycle() == Lifecycle::ShuttingDown {
                continue;
            }

            let flush_every = self
                .config
                .agents
                .get(label)
                .map_or(poll_tick, |agent| agent.agent_flush_interval_s.max(poll_tick));
            if handle.flush_due(now, Duration::from_secs_f64(flush_every)) {
                if !handle.send_command(&OrchestratorCommand::flush()) {
                    debug!(agent = %label, "flush not delivered");
                }
                handle.record_flush(now);
            }

            let drain_started = Instant::now();
            for message in handle.drain(MAX_DRAIN_PER_TICK) {
                sample.count_message(message.type_name());
                handle.observe(&message);
                route_message(label, &message, &mut self.pipeline, level);
            }
            sample.record_drain(label, drain_started.elapsed());
        }
    }

    fn check_heartbeats(&mut self) {
        let now = Utc::now();
        for (label, handle) in self.state.agents.iter_mut() {
            if handle.take_heartbeat_overdue(now) {
                warn!(agent = %label, health = ?handle.health(), "heartbeat overdue");
            }
        }
    }
}

/// Route one message after the handle has observed it.
///
/// Summaries go straight to the sinks and on to any segment source they
/// feed, logs to the console; diagnostics were already stored on the handle
/// and are only traced here.
pub fn route_message(
    label: &str,
    message: &AgentMessage,
    pipeline: &mut SegmentPipeline,
    level: AgentLogLevel,
) {
    match message {
        AgentMessage::Summary(envelope) => {
            pipeline.write_event(&summary_event(label, envelope));
            pipeline.ingest_summary(label, envelope);
        }
        AgentMessage::Log(envelope) => emit_agent_log(label, envelope, level),
        AgentMessage::Handshake(envelope) => {
            info!(
                agent = %label,
                agent_id = %envelope.agent_id,
                agent_version = %envelope.agent_version,
                protocol_version = %envelope.protocol_version,
                "agent handshake"
            );
        }
        AgentMessage::Heartbeat(envelope) => {
            trace!(agent = %label, health = ?envelope.health, "heartbeat");
        }
        AgentMessage::Error(_) => warn!(agent = %label, "{}", message.describe()),
        AgentMessage::Ack(_) => {
            debug!(agent = %label, command = ?message.acked_command(), "ack");
        }
        AgentMessage::Status(_) => debug!(agent = %label, "{}", message.describe()),
        AgentMessage::Other { kind, .. } => {
            debug!(agent = %label, kind = %kind, "ignoring unknown message type");
        }
    }
}

/// A summary as a sink event: the agent's data plus identity and metrics.
pub fn summary_event(label: &str, envelope: &Envelope) -> Event {
    let mut payload = json!({
        "agent_id": envelope.agent_id,
        "agent_version": envelope.agent_version,
        "data": envelope.data,
    });
    if let Some(metrics) = &envelope.metrics {
        payload["metrics"] = Value::Object(metrics.clone());
    }
    Event::at(envelope.timestamp, label, "summary").with_payload(payload)
}

/// Re-emit an agent `log` message under the agent target.
fn emit_agent_log(label: &str, envelope: &Envelope, threshold: AgentLogLevel) {
    let level = envelope
        .data
        .get("level")
        .and_then(Value::as_str)
        .and_then(AgentLogLevel::from_str)
        .unwrap_or_default();
    if level < threshold {
        return;
    }

    let text = envelope
        .message
        .as_deref()
        .or_else(|| envelope.data.get("message").and_then(Value::as_str))
        .unwrap_or_default();

    match level {
        AgentLogLevel::Trace => tracing::trace!(target: AGENT_TARGET, agent = %label, "{}", text),
        AgentLogLevel::Debug => tracing::debug!(target: AGENT_TARGET, agent = %label, "{}", text),
        AgentLogLevel::Info => tracing::info!(target: AGENT_TARGET, agent = %label, "{}", text),
        AgentLogLevel::Warn => tracing::warn!(target: AGENT_TARGET, agent = %label, "{}", text),
        AgentLogLevel::Error => tracing::error!(target: AGENT_TARGET, agent = %label, "{}", text),
    }
}
