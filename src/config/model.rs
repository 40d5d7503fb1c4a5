//! Config struct definition and default implementation.

use super::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Orchestrator configuration.
///
/// This struct represents the contents of `drover.yaml`. Unknown fields in the
/// YAML are ignored for forward compatibility. Relative paths are resolved
/// against the directory of the file the config was loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // =========================================================================
    // Segment and scheduling settings
    // =========================================================================
    /// Quiet period after the last resetting event before a segment closes.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Tick loop cadence.
    #[serde(default = "default_poll_tick_s")]
    pub poll_tick_s: f64,

    /// Per-agent rolling deadline during graceful shutdown.
    #[serde(default = "default_shutdown_timeout_s")]
    pub shutdown_timeout_s: f64,

    /// How long residual messages are drained after the shutdown phase.
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: f64,

    /// Minimum level for re-emitting agent `log` messages.
    #[serde(default)]
    pub agent_log_level: AgentLogLevel,

    // =========================================================================
    // Paths
    // =========================================================================
    /// Lock file, stderr logs, default output and socket live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Control socket path (default: `<state_dir>/control.sock`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Installed plugins, searched first for agent entry points.
    #[serde(default = "default_plugins_root")]
    pub plugins_root: String,

    /// Bundled agent templates, searched second.
    #[serde(default = "default_templates_root")]
    pub templates_root: String,

    /// JSON-lines output (default: `<state_dir>/output/segments.jsonl`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    // =========================================================================
    // Agents
    // =========================================================================
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    /// In-process plugins built from agent summaries, keyed by plugin label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segment_sources: BTreeMap<String, SegmentSourceConfig>,

    /// File this config was loaded from; saves go back here.
    #[serde(skip)]
    pub(crate) source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            poll_tick_s: default_poll_tick_s(),
            shutdown_timeout_s: default_shutdown_timeout_s(),
            drain_timeout_s: default_drain_timeout_s(),
            agent_log_level: AgentLogLevel::default(),
            state_dir: default_state_dir(),
            socket_path: None,
            plugins_root: default_plugins_root(),
            templates_root: default_templates_root(),
            output_path: None,
            agents: BTreeMap::new(),
            segment_sources: BTreeMap::new(),
            source: None,
        }
    }
}
