//! Control requests answered by the tick loop, and the lifecycle actions
//! they queue.
//!
//! Queries are answered immediately. Anything that starts or stops a process
//! is validated, queued, and applied in submission order once every pending
//! request of the tick has been answered.

use super::orchestrator::Orchestrator;
use super::state::SpawnFailure;
use crate::control::{ControlReply, ControlRequest};
use crate::events::format_timestamp;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

/// Most control requests answered in a single tick.
const MAX_CONTROL_REQUESTS_PER_TICK: usize = 64;

/// A deferred change to the set of running agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Start(String),
    Stop(String),
    Restart(String),
}

impl LifecycleAction {
    pub fn label(&self) -> &str {
        match self {
            LifecycleAction::Start(label)
            | LifecycleAction::Stop(label)
            | LifecycleAction::Restart(label) => label,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start(_) => "start",
            LifecycleAction::Stop(_) => "stop",
            LifecycleAction::Restart(_) => "restart",
        }
    }
}

impl Orchestrator {
    /// Stage 1: answer pending requests, then apply what they queued.
    pub(super) fn handle_control_requests(&mut self) {
        let requests: Vec<ControlRequest> = match &self.control {
            Some(rx) => rx.try_iter().take(MAX_CONTROL_REQUESTS_PER_TICK).collect(),
            None => Vec::new(),
        };

        for request in requests {
            let reply = self.dispatch_control(&request);
            if let Err(e) = &reply {
                debug!(cmd = %request.cmd, error = %e, "control request rejected");
            }
            request.respond(reply);
        }

        self.apply_pending_actions();
    }

    /// Answer one control command.
    pub fn dispatch_control(&mut self, request: &ControlRequest) -> ControlReply {
        match request.cmd.as_str() {
            "ping" => Ok(json!({"pong": true})),
            "control_orchestrator" => self.control_orchestrator(request),
            "get_registered_plugins" => Ok(self.registered_plugins()),
            "list_agent_templates" => Ok(json!({
                "templates": self.templates.list().iter().map(|t| t.describe()).collect::<Vec<_>>(),
            })),
            "get_agent_instances" => self.agent_instances(),
            "get_agent_states" => Ok(self.agent_states()),
            "start_agent" => self.queue_start(request),
            "stop_agent" => self.queue_stop(request),
            "restart_agent" => self.queue_restart(request),
            "add_agent_instance" => self.add_agent_instance(request),
            "duplicate_agent_instance" => self.duplicate_agent_instance(request),
            "remove_agent_instance" => self.remove_agent_instance(request),
            "update_agent_instance" => self.update_agent_instance(request),
            "get_monitor_settings" => Ok(self.config.settings_json()),
            "update_monitor_settings" => self.update_monitor_settings(request),
            "list_installed_plugins" => self
                .archives
                .list_installed()
                .map(|plugins| json!({"plugins": plugins}))
                .map_err(|e| e.to_string()),
            "get_plugin_info" => {
                let name = request.require_str("name")?;
                self.archives.plugin_info(name).map_err(|e| e.to_string())
            }
            "install_plugin_archive" => {
                let path = request.require_str("path")?;
                self.archives
                    .install_archive(Path::new(path))
                    .map_err(|e| e.to_string())
            }
            "uninstall_plugin" => {
                let name = request.require_str("name")?;
                self.archives.uninstall(name).map_err(|e| e.to_string())
            }
            "render_agent_widget" => {
                let label = request.require_str("label")?;
                let agent = self
                    .config
                    .agents
                    .get(label)
                    .ok_or_else(|| unknown_agent(label))?;
                Ok(self
                    .templates
                    .render_widget(label, agent.template_id.as_deref()))
            }
            other => Err(format!("unknown command '{}'", other)),
        }
    }

    fn control_orchestrator(&mut self, request: &ControlRequest) -> ControlReply {
        match request.arg_str("action") {
            Some("status") => Ok(self.status()),
            Some("stop") => {
                self.stop.request_stop();
                Ok(json!({"stopping": true}))
            }
            Some(other) => Err(format!("unknown orchestrator action '{}'", other)),
            None => Err("'control_orchestrator' requires an 'action'".to_string()),
        }
    }

    /// Snapshot for `control_orchestrator{action: status}`.
    pub fn status(&self) -> Value {
        json!({
            "pid": std::process::id(),
            "started_at": format_timestamp(&self.state.started_at),
            "uptime_s": self.state.uptime_s(),
            "tick_count": self.state.tick_count,
            "stopping": self.stop.is_stop_requested(),
            "agents": {
                "configured": self.config.agents.len(),
                "enabled": self.config.agents.values().filter(|a| a.enabled).count(),
                "handles": self.state.agent_counts(),
            },
            "pending_actions": self.state.pending.len(),
            "segment": self.pipeline.segment_info(),
            "pipeline": {
                "events_written": self.pipeline.stats.events_written,
                "segments_written": self.pipeline.stats.segments_written,
                "segments_dropped": self.pipeline.stats.segments_dropped,
                "sinks": self.pipeline.sinks.len(),
            },
            "telemetry": self.telemetry.summary(),
        })
    }

    fn registered_plugins(&self) -> Value {
        let agents: Vec<Value> = self
            .config
            .agents
            .iter()
            .map(|(label, agent)| {
                json!({
                    "label": label,
                    "template_id": agent.template_id,
                    "enabled": agent.enabled,
                    "executable": agent.executable,
                })
            })
            .collect();
        json!({
            "plugins": self.pipeline.plugins.describe(),
            "agents": agents,
        })
    }

    fn agent_instances(&self) -> ControlReply {
        let mut instances = Vec::with_capacity(self.config.agents.len());
        for (label, agent) in &self.config.agents {
            let handle = self.state.handle(label);
            let failure = self.state.spawn_failures.get(label);
            let lifecycle = match (handle, failure) {
                (Some(handle), _) => handle.lifecycle().as_str(),
                (None, Some(_)) => "error",
                (None, None) => "inactive",
            };
            let last_error = match (handle, failure) {
                (Some(handle), _) => handle.last_error().cloned(),
                (None, failure) => failure.map(SpawnFailure::to_json),
            };
            instances.push(json!({
                "label": label,
                "config": serde_json::to_value(agent).map_err(|e| e.to_string())?,
                "running": handle.is_some_and(|h| !h.has_exited()),
                "lifecycle": lifecycle,
                "last_error": last_error,
            }));
        }
        Ok(json!({"instances": instances}))
    }

    fn agent_states(&self) -> Value {
        let mut states: serde_json::Map<String, Value> = self
            .state
            .agents
            .iter()
            .chain(self.state.stopping.iter())
            .map(|(label, handle)| (label.clone(), handle.snapshot()))
            .collect();
        for (label, failure) in &self.state.spawn_failures {
            states.entry(label.clone()).or_insert_with(|| {
                json!({
                    "label": label,
                    "lifecycle": "error",
                    "alive": false,
                    "last_error": failure.to_json(),
                })
            });
        }
        json!({"agents": states})
    }

    fn queue_start(&mut self, request: &ControlRequest) -> ControlReply {
        let label = self.require_configured(request)?;
        if self.state.is_running(&label) {
            return Err(format!("agent '{}' is already running", label));
        }
        Ok(self.queue(LifecycleAction::Start(label)))
    }

    fn queue_stop(&mut self, request: &ControlRequest) -> ControlReply {
        let label = self.require_configured(request)?;
        Ok(self.queue(LifecycleAction::Stop(label)))
    }

    fn queue_restart(&mut self, request: &ControlRequest) -> ControlReply {
        let label = self.require_configured(request)?;
        Ok(self.queue(LifecycleAction::Restart(label)))
    }

    fn add_agent_instance(&mut self, request: &ControlRequest) -> ControlReply {
        let template_id = request.require_str("template_id")?;
        let template = self.templates.get(template_id).map_err(|e| e.to_string())?;
        let base = request.arg_str("requested_label").unwrap_or(template_id);
        let label = self.config.allocate_label(base);

        self.config
            .agents
            .insert(label.clone(), template.to_agent_config());
        if let Err(e) = self.persist() {
            self.config.agents.remove(&label);
            return Err(e);
        }

        info!(agent = %label, template = %template_id, "agent instance added");
        let mut reply = self.queue(LifecycleAction::Start(label.clone()));
        reply["label"] = json!(label);
        Ok(reply)
    }

    fn duplicate_agent_instance(&mut self, request: &ControlRequest) -> ControlReply {
        let source = request.require_str("label")?;
        let agent = self
            .config
            .agents
            .get(source)
            .cloned()
            .ok_or_else(|| unknown_agent(source))?;
        let base = request.arg_str("requested_label").unwrap_or(source);
        let label = self.config.allocate_label(base);
        let enabled = agent.enabled;

        self.config.agents.insert(label.clone(), agent);
        if let Err(e) = self.persist() {
            self.config.agents.remove(&label);
            return Err(e);
        }

        info!(agent = %label, source = %source, "agent instance duplicated");
        let mut reply = if enabled {
            self.queue(LifecycleAction::Start(label.clone()))
        } else {
            json!({"queued": false})
        };
        reply["label"] = json!(label);
        Ok(reply)
    }

    fn remove_agent_instance(&mut self, request: &ControlRequest) -> ControlReply {
        let label = self.require_configured(request)?;
        let fed = self.config.sources_fed_by(&label);
        if !fed.is_empty() {
            return Err(format!(
                "agent '{}' feeds segment source(s) {}",
                label,
                fed.join(", ")
            ));
        }
        let Some(agent) = self.config.agents.remove(&label) else {
            return Err(unknown_agent(&label));
        };
        if let Err(e) = self.persist() {
            self.config.agents.insert(label, agent);
            return Err(e);
        }

        self.state.spawn_failures.remove(&label);
        info!(agent = %label, "agent instance removed");
        let mut reply = self.queue(LifecycleAction::Stop(label.clone()));
        reply["removed"] = json!(true);
        Ok(reply)
    }

    fn update_agent_instance(&mut self, request: &ControlRequest) -> ControlReply {
        let label = self.require_configured(request)?;
        let updates = request.require_object("updates")?;

        let before = self.config.agents.get(&label).cloned();
        let update = self
            .config
            .apply_agent_updates(&label, updates)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.persist() {
            if let Some(before) = before {
                self.config.agents.insert(label, before);
            }
            return Err(e);
        }

        let running = self.state.is_running(&label);
        let action = match update.enabled_changed {
            Some(false) if running => Some(LifecycleAction::Stop(label.clone())),
            Some(false) => None,
            Some(true) if !running => Some(LifecycleAction::Start(label.clone())),
            _ if update.needs_restart && running => Some(LifecycleAction::Restart(label.clone())),
            _ => None,
        };

        info!(agent = %label, changed = ?update.changed, "agent instance updated");
        let queued = action.as_ref().map(|a| a.as_str());
        if let Some(action) = action {
            self.state.pending.push_back(action);
        }
        Ok(json!({
            "label": label,
            "changed": update.changed,
            "queued": queued,
        }))
    }

    fn update_monitor_settings(&mut self, request: &ControlRequest) -> ControlReply {
        let updates = request.require_object("updates")?;
        let before = self.config.clone();
        let changed = self
            .config
            .apply_settings(updates)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.persist() {
            self.config = before;
            return Err(e);
        }

        if let Err(e) = self
            .pipeline
            .cooldown
            .set_cooldown(self.config.cooldown_seconds)
        {
            error!(error = %e, "validated cooldown rejected by the timer");
        }

        info!(changed = ?changed, "monitor settings updated");
        Ok(json!({
            "changed": changed,
            "settings": self.config.settings_json(),
        }))
    }

    fn require_configured(&self, request: &ControlRequest) -> Result<String, String> {
        let label = request.require_str("label")?;
        if !self.config.agents.contains_key(label) {
            return Err(unknown_agent(label));
        }
        Ok(label.to_string())
    }

    fn queue(&mut self, action: LifecycleAction) -> Value {
        let reply = json!({
            "queued": true,
            "action": action.as_str(),
            "label": action.label(),
        });
        self.state.pending.push_back(action);
        reply
    }

    fn persist(&self) -> Result<(), String> {
        self.config
            .save()
            .map_err(|e| format!("failed to persist config: {}", e))
    }

    /// Apply queued lifecycle actions in submission order.
    pub(super) fn apply_pending_actions(&mut self) {
        while let Some(action) = self.state.pending.pop_front() {
            debug!(action = action.as_str(), agent = %action.label(), "applying lifecycle action");
            match action {
                LifecycleAction::Start(label) => {
                    self.spawn_agent(&label);
                }
                LifecycleAction::Stop(label) => self.stop_agent(&label),
                LifecycleAction::Restart(label) => {
                    self.stop_agent(&label);
                    self.spawn_agent(&label);
                }
            }
        }
    }

    /// Spawn `label` from its config unless it is already running.
    ///
    /// A label whose previous process is still stopping is spawned once that
    /// handle is gone.
    pub(super) fn spawn_agent(&mut self, label: &str) -> bool {
        let Some(agent) = self.config.agents.get(label) else {
            error!(agent = %label, "cannot start an agent that is not configured");
            return false;
        };
        if self.state.is_running(label) {
            debug!(agent = %label, "agent already running");
            return false;
        }
        if self.state.stopping.contains_key(label) {
            debug!(agent = %label, "previous process still stopping, start deferred");
            self.state.respawn.insert(label.to_string());
            return false;
        }

        match self.manager.spawn(label, agent) {
            Ok(handle) => {
                self.state.spawn_failures.remove(label);
                self.state.agents.insert(label.to_string(), handle);
                true
            }
            Err(e) => {
                error!(agent = %label, error = %e, "failed to start agent");
                self.state
                    .spawn_failures
                    .insert(label.to_string(), SpawnFailure::new(e.to_string()));
                false
            }
        }
    }

    /// Begin stopping `label`. Later ticks reap or kill the process.
    pub(super) fn stop_agent(&mut self, label: &str) {
        self.state.respawn.remove(label);
        self.state.spawn_failures.remove(label);
        let Some(mut handle) = self.state.agents.remove(label) else {
            debug!(agent = %label, "agent not running");
            return;
        };
        let grace = Duration::from_secs_f64(self.config.shutdown_timeout_s);
        if handle.begin_stop(grace) {
            info!(agent = %label, grace_s = grace.as_secs_f64(), "agent stopping");
        }
        self.state.stopping.insert(label.to_string(), handle);
    }
}

fn unknown_agent(label: &str) -> String {
    format!("unknown agent '{}'", label)
}
