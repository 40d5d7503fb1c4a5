//! Configuration types, constants, and default value functions.

use crate::plugins::Reduction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "drover.yaml";

/// Unix socket paths longer than this do not fit `sockaddr_un` everywhere.
pub const MAX_SOCKET_PATH_LEN: usize = 100;

/// Keys `update_agent_instance` may change.
pub const AGENT_UPDATE_KEYS: &[&str] = &[
    "enabled",
    "executable",
    "interpreter",
    "args",
    "env",
    "heartbeat_interval_s",
    "agent_flush_interval_s",
];

/// Agent keys whose change requires a restart of a running agent.
pub const RESTART_KEYS: &[&str] = &["executable", "interpreter", "args", "env"];

/// Keys `update_monitor_settings` may change.
pub const SETTINGS_KEYS: &[&str] = &[
    "cooldown_seconds",
    "poll_tick_s",
    "shutdown_timeout_s",
    "drain_timeout_s",
    "agent_log_level",
];

static LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("Invalid label regex")
});

/// Check that a label is usable as an agent or plugin identifier.
pub fn is_valid_label(label: &str) -> bool {
    LABEL_REGEX.is_match(label)
}

/// Minimum level at which agent `log` messages are re-emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl AgentLogLevel {
    /// Parse a level name. Accepts `warning` as an alias for `warn`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "critical" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

/// One configured agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Template this instance was created from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// Entry point, resolved inside the plugins or templates root.
    pub executable: String,

    /// Optional launcher command line, e.g. `python3 -u`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: f64,

    #[serde(default = "default_agent_flush_interval_s")]
    pub agent_flush_interval_s: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template_id: None,
            executable: String::new(),
            interpreter: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            agent_flush_interval_s: default_agent_flush_interval_s(),
        }
    }
}

/// An in-process plugin fed by one agent's summaries.
///
/// Each summary the agent emits becomes an event under the source's label;
/// values of `data_header` are reduced per segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSourceConfig {
    /// Agent label whose summaries feed this source.
    pub agent: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_header: Option<String>,

    #[serde(default = "default_true")]
    pub resetting: bool,

    #[serde(default)]
    pub reduction: Reduction,
}

/// What `update_agent_instance` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentUpdate {
    /// Keys whose value actually changed.
    pub changed: Vec<String>,
    /// Set when `enabled` flipped.
    pub enabled_changed: Option<bool>,
    /// A running instance must be restarted to pick up the change.
    pub needs_restart: bool,
}

// Default value functions for serde
pub(crate) fn default_cooldown_seconds() -> f64 {
    10.0
}
pub(crate) fn default_poll_tick_s() -> f64 {
    0.5
}
pub(crate) fn default_shutdown_timeout_s() -> f64 {
    10.0
}
pub(crate) fn default_drain_timeout_s() -> f64 {
    2.0
}
pub(crate) fn default_state_dir() -> String {
    ".drover".to_string()
}
pub(crate) fn default_plugins_root() -> String {
    "plugins".to_string()
}
pub(crate) fn default_templates_root() -> String {
    "templates".to_string()
}
pub(crate) fn default_heartbeat_interval_s() -> f64 {
    5.0
}
pub(crate) fn default_agent_flush_interval_s() -> f64 {
    1.0
}
pub(crate) fn default_true() -> bool {
    true
}
