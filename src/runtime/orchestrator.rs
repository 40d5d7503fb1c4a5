//! The orchestrator: owner of every agent handle, the segment pipeline and
//! the configuration, driven by a fixed-cadence tick loop.

use super::state::{PipelineStats, RuntimeState, SegmentPipeline};
use super::telemetry::Telemetry;
use crate::agent::ProcessManager;
use crate::config::Config;
use crate::control::{ControlRequest, ControlServer};
use crate::error::{DroverError, Result};
use crate::plugins::{Plugin, PluginRegistry, SummaryPlugin};
use crate::segment::CooldownTimer;
use crate::shutdown::{ShutdownContext, ShutdownReport, ShutdownSequencer};
use crate::signals::StopSignal;
use crate::sink::{Sink, SinkSet};
use crate::templates::{FsPluginRegistry, PluginArchiveRegistry, TemplateCatalog};
use crossbeam::channel::Receiver;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Upper bound on one sleep slice between stop-signal checks.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub struct Orchestrator {
    pub(super) config: Config,
    pub(super) manager: ProcessManager,
    pub(super) templates: TemplateCatalog,
    pub(super) archives: Box<dyn PluginArchiveRegistry>,
    pub(super) pipeline: SegmentPipeline,
    pub(super) state: RuntimeState,
    pub(super) telemetry: Telemetry,
    pub(super) control: Option<Receiver<ControlRequest>>,
    pub(super) stop: StopSignal,
}

impl Orchestrator {
    /// Build an orchestrator for a validated config. No agent is started yet.
    pub fn new(config: Config, stop: StopSignal) -> Result<Self> {
        config.validate()?;
        let cooldown = CooldownTimer::new(config.cooldown_seconds)
            .map_err(|e| DroverError::UserError(e.to_string()))?;
        let mut plugins = PluginRegistry::new();
        for (label, source) in &config.segment_sources {
            plugins.register(Box::new(SummaryPlugin::from_config(label, source)))?;
        }

        Ok(Self {
            manager: ProcessManager::from_config(&config),
            templates: TemplateCatalog::new(config.templates_root()),
            archives: Box::new(FsPluginRegistry::new(config.plugins_root())),
            pipeline: SegmentPipeline::new(plugins, cooldown, SinkSet::new()),
            state: RuntimeState::new(),
            telemetry: Telemetry::new(),
            control: None,
            stop,
            config,
        })
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        self.pipeline.sinks.push(sink);
    }

    /// Register an in-process plugin. Its label must not clash with an agent.
    pub fn register_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        if self.config.agents.contains_key(plugin.label()) {
            return Err(DroverError::UserError(format!(
                "plugin label '{}' is already used by an agent",
                plugin.label()
            )));
        }
        self.pipeline.plugins.register(plugin)
    }

    pub fn set_archive_registry(&mut self, archives: Box<dyn PluginArchiveRegistry>) {
        self.archives = archives;
    }

    /// Receive control requests forwarded by a [`ControlServer`].
    pub fn attach_control(&mut self, requests: Receiver<ControlRequest>) {
        self.control = Some(requests);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn tick_count(&self) -> u64 {
        self.state.tick_count
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Labels with a live handle.
    pub fn running_agents(&self) -> Vec<String> {
        self.state.live_labels()
    }

    /// Spawn every enabled agent. Returns how many started.
    pub fn start_agents(&mut self) -> usize {
        let labels: Vec<String> = self
            .config
            .agents
            .iter()
            .filter(|(_, agent)| agent.enabled)
            .map(|(label, _)| label.clone())
            .collect();

        labels
            .iter()
            .filter(|label| self.spawn_agent(label))
            .count()
    }

    /// Run ticks until the stop signal trips (or once, with `once`).
    pub fn run(&mut self, once: bool) {
        let started = self.start_agents();
        info!(
            agents = started,
            configured = self.config.agents.len(),
            plugins = self.pipeline.plugins.len(),
            poll_tick_s = self.config.poll_tick_s,
            "orchestrator running"
        );

        while !self.stop.is_stop_requested() {
            let tick_started = Instant::now();
            self.tick();
            if once {
                break;
            }
            self.sleep_remainder(tick_started);
        }

        info!(ticks = self.state.tick_count, "tick loop finished");
    }

    /// Sleep out the rest of the tick in short slices, waking early on stop.
    fn sleep_remainder(&self, tick_started: Instant) {
        let tick = Duration::from_secs_f64(self.config.poll_tick_s);
        loop {
            let elapsed = tick_started.elapsed();
            if elapsed >= tick || self.stop.is_stop_requested() {
                return;
            }
            thread::sleep((tick - elapsed).min(SLEEP_SLICE));
        }
    }

    /// Run the shutdown sequence. The control server is stopped last.
    pub fn shutdown(mut self, server: Option<ControlServer>) -> ShutdownReport {
        self.stop.request_stop();
        self.finish_stopping_agents();
        let report = ShutdownSequencer::from_config(&self.config).run(ShutdownContext {
            agents: &mut self.state.agents,
            pipeline: &mut self.pipeline,
            agent_log_level: self.config.agent_log_level,
            control: self.control.as_ref(),
            server,
        });

        if !report.is_clean() {
            warn!(
                missing = report.missing_total(),
                forced = report.forced_kills(),
                "shutdown finished with missing acknowledgements"
            );
        }
        report
    }
}
