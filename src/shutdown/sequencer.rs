//! The ordered shutdown sequence.
//!
//! Steps run in a fixed order and each one is best effort: a step that
//! fails is logged and the next one still runs.
//!
//! 1. send `sequence[stop, flush, shutdown]` to every agent
//! 2. wait for each agent's four signals under a rolling deadline
//! 3. record one diagnostic per missing signal
//! 4. force-kill whatever is still alive
//! 5. drain residual messages for the drain timeout
//! 6. close the open segment, flush and close every sink
//! 7. stop the control server

use super::tracker::{ShutdownPhase, ShutdownSignal, ShutdownTracker};
use crate::agent::{AgentHandle, Lifecycle};
use crate::config::{AgentLogLevel, Config};
use crate::control::{ControlRequest, ControlServer};
use crate::events::Event;
use crate::protocol::OrchestratorCommand;
use crate::runtime::{MAX_DRAIN_PER_TICK, SegmentPipeline, route_message};
use crossbeam::channel::Receiver;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sleep between polls while waiting on agents.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

static SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Everything the sequence touches, borrowed from the orchestrator.
pub struct ShutdownContext<'a> {
    pub agents: &'a mut BTreeMap<String, AgentHandle>,
    pub pipeline: &'a mut SegmentPipeline,
    pub agent_log_level: AgentLogLevel,
    /// Requests still queued are answered with an error.
    pub control: Option<&'a Receiver<ControlRequest>>,
    pub server: Option<ControlServer>,
}

/// How one agent's shutdown ended.
#[derive(Debug, Clone, Serialize)]
pub struct AgentShutdown {
    pub label: String,
    pub phase: ShutdownPhase,
    /// Furthest step reached before the phase resolved.
    pub reached: ShutdownPhase,
    pub missing: Vec<ShutdownSignal>,
    pub delivered: bool,
    pub forced: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub agents: Vec<AgentShutdown>,
    pub segment_closed: bool,
    pub residual_messages: usize,
    pub rejected_requests: usize,
    pub elapsed_s: f64,
}

impl ShutdownReport {
    /// Every agent sent every signal and none had to be killed.
    pub fn is_clean(&self) -> bool {
        self.agents.iter().all(|a| a.missing.is_empty() && !a.forced)
    }

    pub fn missing_total(&self) -> usize {
        self.agents.iter().map(|a| a.missing.len()).sum()
    }

    pub fn forced_kills(&self) -> usize {
        self.agents.iter().filter(|a| a.forced).count()
    }

    pub fn agent(&self, label: &str) -> Option<&AgentShutdown> {
        self.agents.iter().find(|a| a.label == label)
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSequencer {
    shutdown_timeout: Duration,
    drain_timeout: Duration,
}

impl ShutdownSequencer {
    pub fn new(shutdown_timeout: Duration, drain_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            drain_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_secs_f64(config.shutdown_timeout_s),
            Duration::from_secs_f64(config.drain_timeout_s),
        )
    }

    pub fn run(self, mut ctx: ShutdownContext<'_>) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        info!(
            agents = ctx.agents.len(),
            timeout_s = self.shutdown_timeout.as_secs_f64(),
            "shutdown sequence started"
        );

        let mut trackers = self.send_sequences(ctx.agents);
        report.rejected_requests += self.await_signals(&mut ctx, &mut trackers);
        record_missing_signals(&trackers, ctx.pipeline);
        let forced = force_kill_survivors(ctx.agents);
        report.residual_messages = self.drain_residual(&mut ctx);
        report.rejected_requests += reject_pending(ctx.control);

        report.segment_closed = ctx.pipeline.close_open_segment();
        ctx.pipeline.sinks.flush();
        ctx.pipeline.sinks.close();

        if let Some(mut server) = ctx.server.take() {
            server.stop();
        }

        report.agents = trackers
            .into_iter()
            .map(|(label, tracker)| {
                let exit_code = ctx.agents.get(&label).and_then(AgentHandle::exit_code);
                AgentShutdown {
                    forced: forced.iter().any(|f| *f == label),
                    phase: tracker.phase(),
                    reached: tracker.progress(),
                    missing: tracker.missing(),
                    delivered: tracker.delivered(),
                    exit_code,
                    label,
                }
            })
            .collect();
        report.elapsed_s = started.elapsed().as_secs_f64();

        info!(
            elapsed_s = report.elapsed_s,
            missing = report.missing_total(),
            forced = report.forced_kills(),
            residual = report.residual_messages,
            "shutdown sequence finished"
        );
        report
    }

    /// Step 1. Every handle gets a tracker, even one whose process is gone.
    fn send_sequences(
        &self,
        agents: &mut BTreeMap<String, AgentHandle>,
    ) -> BTreeMap<String, ShutdownTracker> {
        let now = Instant::now();
        let mut trackers = BTreeMap::new();

        for (label, handle) in agents.iter_mut() {
            let id = format!("shutdown-{}", SEQUENCE_ID.fetch_add(1, Ordering::Relaxed));
            let delivered =
                handle.is_alive() && handle.send_command(&OrchestratorCommand::shutdown_sequence(&id));
            if delivered {
                debug!(agent = %label, id = %id, "shutdown sequence sent");
            } else {
                warn!(agent = %label, "shutdown sequence not delivered");
            }
            handle.set_lifecycle(Lifecycle::ShuttingDown);
            trackers.insert(
                label.clone(),
                ShutdownTracker::new(self.shutdown_timeout, now, delivered),
            );
        }
        trackers
    }

    /// Step 2. Returns how many control requests were turned away meanwhile.
    fn await_signals(
        &self,
        ctx: &mut ShutdownContext<'_>,
        trackers: &mut BTreeMap<String, ShutdownTracker>,
    ) -> usize {
        let mut rejected = 0;
        loop {
            rejected += reject_pending(ctx.control);
            let now = Instant::now();
            let mut waiting = 0;

            for (label, tracker) in trackers.iter_mut() {
                if tracker.is_terminal() {
                    continue;
                }
                let Some(handle) = ctx.agents.get_mut(label) else {
                    tracker.resolve();
                    continue;
                };

                for message in handle.drain(MAX_DRAIN_PER_TICK) {
                    handle.observe(&message);
                    let before = tracker.phase();
                    let after = tracker.on_message(&message, now);
                    if before != after {
                        debug!(agent = %label, phase = after.as_str(), "shutdown progress");
                    }
                    route_message(label, &message, ctx.pipeline, ctx.agent_log_level);
                }

                if !handle.is_alive() {
                    tracker.on_exit();
                    if handle.is_drained() {
                        tracker.resolve();
                    }
                }
                if tracker.is_terminal() || tracker.check_deadline(now) {
                    continue;
                }
                waiting += 1;
            }

            if waiting == 0 {
                return rejected;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Step 5. Route whatever arrives until every channel is drained.
    fn drain_residual(&self, ctx: &mut ShutdownContext<'_>) -> usize {
        let deadline = Instant::now() + self.drain_timeout;
        let mut drained = 0;
        loop {
            for (label, handle) in ctx.agents.iter_mut() {
                for message in handle.drain(MAX_DRAIN_PER_TICK) {
                    handle.observe(&message);
                    route_message(label, &message, ctx.pipeline, ctx.agent_log_level);
                    drained += 1;
                }
            }
            if ctx.agents.values().all(AgentHandle::is_drained) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        if drained > 0 {
            debug!(messages = drained, "residual messages drained");
        }
        drained
    }
}

/// Step 3. One warning and one sink event per missing signal.
fn record_missing_signals(
    trackers: &BTreeMap<String, ShutdownTracker>,
    pipeline: &mut SegmentPipeline,
) {
    for (label, tracker) in trackers {
        for signal in tracker.missing() {
            warn!(
                agent = %label,
                signal = signal.as_str(),
                reached = tracker.progress().as_str(),
                delivered = tracker.delivered(),
                "shutdown signal missing"
            );
            let event = Event::new(label.as_str(), "shutdown_missing_ack").with_payload(json!({
                "signal": signal.as_str(),
                "reached": tracker.progress().as_str(),
                "delivered": tracker.delivered(),
            }));
            pipeline.write_event(&event);
        }
    }
}

/// Step 4. Returns the labels that had to be killed.
fn force_kill_survivors(agents: &mut BTreeMap<String, AgentHandle>) -> Vec<String> {
    let mut forced = Vec::new();
    for (label, handle) in agents.iter_mut() {
        if handle.is_alive() {
            warn!(agent = %label, pid = handle.pid(), "agent still running, killing");
            handle.kill();
            handle.set_lifecycle(Lifecycle::Error);
            forced.push(label.clone());
        } else {
            handle.set_lifecycle(Lifecycle::Inactive);
        }
    }
    forced
}

/// Answer every queued control request with an error.
fn reject_pending(control: Option<&Receiver<ControlRequest>>) -> usize {
    let Some(requests) = control else {
        return 0;
    };
    let mut rejected = 0;
    for request in requests.try_iter() {
        debug!(cmd = %request.cmd, "rejecting control request during shutdown");
        request.respond(Err("orchestrator is shutting down".to_string()));
        rejected += 1;
    }
    rejected
}
