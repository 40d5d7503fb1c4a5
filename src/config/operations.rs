//! Config loading, validation, persistence, and live updates.

use super::model::Config;
use super::types::*;
use crate::error::{DroverError, Result};
use crate::fs::atomic_write_file;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

impl Config {
    /// Load config from a YAML file.
    ///
    /// Unknown fields in the YAML are silently ignored for forward compatibility.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            DroverError::UserError(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load config if the file exists, otherwise start from defaults that will
    /// be saved to `path` on the first persisted change.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self {
            source: Some(path.to_path_buf()),
            ..Self::default()
        })
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty mapping.
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|e| DroverError::UserError(format!("failed to parse config YAML: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            DroverError::UserError(format!("failed to serialize config to YAML: {}", e))
        })
    }

    /// Atomically write the config back to the file it was loaded from.
    ///
    /// Configs built in memory have no source and are not persisted.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        atomic_write_file(path, &self.to_yaml()?)
    }

    /// File this config is persisted to, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Validate config values and return error on invalid values.
    ///
    /// Validation rules:
    /// - `cooldown_seconds` and `poll_tick_s` must be positive
    /// - `shutdown_timeout_s` and `drain_timeout_s` must not be negative
    /// - agent labels must match the label pattern
    /// - agents need a non-empty `executable` and positive intervals
    pub fn validate(&self) -> Result<()> {
        require_positive("cooldown_seconds", self.cooldown_seconds)?;
        require_positive("poll_tick_s", self.poll_tick_s)?;
        require_non_negative("shutdown_timeout_s", self.shutdown_timeout_s)?;
        require_non_negative("drain_timeout_s", self.drain_timeout_s)?;

        for (label, agent) in &self.agents {
            if !is_valid_label(label) {
                return Err(DroverError::UserError(format!(
                    "config validation failed: invalid agent label '{}' (use letters, digits, '_', '.', '-'; max 64 chars)",
                    label
                )));
            }
            validate_agent(label, agent)?;
        }

        for (label, source) in &self.segment_sources {
            validate_segment_source(label, source, &self.agents)?;
        }

        Ok(())
    }

    // =========================================================================
    // Resolved paths
    // =========================================================================

    /// Directory relative paths are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve_path(&self.state_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(raw) => self.resolve_path(raw),
            None => self.state_dir().join("control.sock"),
        }
    }

    pub fn plugins_root(&self) -> PathBuf {
        self.resolve_path(&self.plugins_root)
    }

    pub fn templates_root(&self) -> PathBuf {
        self.resolve_path(&self.templates_root)
    }

    pub fn output_path(&self) -> PathBuf {
        match &self.output_path {
            Some(raw) => self.resolve_path(raw),
            None => self.state_dir().join("output").join("segments.jsonl"),
        }
    }

    /// Directory holding per-agent stderr logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Singleton instance lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("drover.lock")
    }

    // =========================================================================
    // Monitor settings
    // =========================================================================

    /// Current values of the live-updatable settings.
    pub fn settings_json(&self) -> Value {
        json!({
            "cooldown_seconds": self.cooldown_seconds,
            "poll_tick_s": self.poll_tick_s,
            "shutdown_timeout_s": self.shutdown_timeout_s,
            "drain_timeout_s": self.drain_timeout_s,
            "agent_log_level": self.agent_log_level.as_str(),
        })
    }

    /// Apply allow-listed setting updates.
    ///
    /// All-or-nothing: an unknown key or an invalid value leaves the config
    /// untouched. Returns the keys whose value changed.
    pub fn apply_settings(&mut self, updates: &Map<String, Value>) -> Result<Vec<String>> {
        reject_unknown_keys(updates, SETTINGS_KEYS, "setting")?;

        let mut next = self.clone();
        for (key, value) in updates {
            match key.as_str() {
                "cooldown_seconds" => next.cooldown_seconds = number(key, value)?,
                "poll_tick_s" => next.poll_tick_s = number(key, value)?,
                "shutdown_timeout_s" => next.shutdown_timeout_s = number(key, value)?,
                "drain_timeout_s" => next.drain_timeout_s = number(key, value)?,
                "agent_log_level" => {
                    let raw = string(key, value)?;
                    next.agent_log_level = AgentLogLevel::from_str(&raw).ok_or_else(|| {
                        DroverError::UserError(format!("unknown agent_log_level '{}'", raw))
                    })?;
                }
                other => return Err(unknown_key("setting", other)),
            }
        }
        next.validate()?;

        let before = self.settings_json();
        let after = next.settings_json();
        let changed = SETTINGS_KEYS
            .iter()
            .filter(|k| before[**k] != after[**k])
            .map(|k| k.to_string())
            .collect();

        *self = next;
        Ok(changed)
    }

    // =========================================================================
    // Agent instances
    // =========================================================================

    /// Apply allow-listed updates to one agent. All-or-nothing.
    pub fn apply_agent_updates(
        &mut self,
        label: &str,
        updates: &Map<String, Value>,
    ) -> Result<AgentUpdate> {
        reject_unknown_keys(updates, AGENT_UPDATE_KEYS, "agent field")?;
        let current = self
            .agents
            .get(label)
            .ok_or_else(|| DroverError::UserError(format!("unknown agent '{}'", label)))?;

        let mut next = current.clone();
        for (key, value) in updates {
            match key.as_str() {
                "enabled" => {
                    next.enabled = value.as_bool().ok_or_else(|| invalid(key, "a boolean"))?
                }
                "executable" => next.executable = string(key, value)?,
                "interpreter" => {
                    next.interpreter = match value {
                        Value::Null => None,
                        other => Some(string(key, other)?).filter(|s| !s.trim().is_empty()),
                    }
                }
                "args" => next.args = string_list(key, value)?,
                "env" => next.env = string_map(key, value)?,
                "heartbeat_interval_s" => next.heartbeat_interval_s = number(key, value)?,
                "agent_flush_interval_s" => next.agent_flush_interval_s = number(key, value)?,
                other => return Err(unknown_key("agent field", other)),
            }
        }
        validate_agent(label, &next)?;

        let before = serde_json::to_value(current).unwrap_or(Value::Null);
        let after = serde_json::to_value(&next).unwrap_or(Value::Null);
        let changed: Vec<String> = AGENT_UPDATE_KEYS
            .iter()
            .filter(|k| before.get(**k) != after.get(**k))
            .map(|k| k.to_string())
            .collect();

        let update = AgentUpdate {
            enabled_changed: (current.enabled != next.enabled).then_some(next.enabled),
            needs_restart: changed.iter().any(|k| RESTART_KEYS.contains(&k.as_str())),
            changed,
        };

        self.agents.insert(label.to_string(), next);
        Ok(update)
    }

    /// Pick a label not yet in use: `base`, then `base-2`, `base-3`, ...
    ///
    /// An invalid `base` falls back to `agent`.
    pub fn allocate_label(&self, base: &str) -> String {
        let base = if is_valid_label(base) { base } else { "agent" };
        let taken = |label: &str| {
            self.agents.contains_key(label) || self.segment_sources.contains_key(label)
        };
        if !taken(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !taken(candidate) && is_valid_label(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Segment sources fed by `agent`.
    pub fn sources_fed_by(&self, agent: &str) -> Vec<&str> {
        self.segment_sources
            .iter()
            .filter(|(_, source)| source.agent == agent)
            .map(|(label, _)| label.as_str())
            .collect()
    }
}

fn validate_segment_source(
    label: &str,
    source: &SegmentSourceConfig,
    agents: &BTreeMap<String, AgentConfig>,
) -> Result<()> {
    let invalid = |reason: String| {
        Err(DroverError::UserError(format!(
            "config validation failed: segment source '{}' {}",
            label, reason
        )))
    };
    if !is_valid_label(label) {
        return invalid("has an invalid label".to_string());
    }
    if agents.contains_key(label) {
        return invalid("clashes with an agent label".to_string());
    }
    if !agents.contains_key(&source.agent) {
        return invalid(format!("refers to unknown agent '{}'", source.agent));
    }
    if source.data_header.as_deref().is_some_and(|h| h.trim().is_empty()) {
        return invalid("has an empty data_header".to_string());
    }
    Ok(())
}

fn validate_agent(label: &str, agent: &AgentConfig) -> Result<()> {
    if agent.executable.trim().is_empty() {
        return Err(DroverError::UserError(format!(
            "config validation failed: agent '{}' has no executable",
            label
        )));
    }
    require_positive(
        &format!("agents.{}.heartbeat_interval_s", label),
        agent.heartbeat_interval_s,
    )?;
    require_positive(
        &format!("agents.{}.agent_flush_interval_s", label),
        agent.agent_flush_interval_s,
    )?;
    Ok(())
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        return Ok(());
    }
    Err(DroverError::UserError(format!(
        "config validation failed: {} must be greater than 0 (got {})",
        name, value
    )))
}

fn require_non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(DroverError::UserError(format!(
        "config validation failed: {} must not be negative (got {})",
        name, value
    )))
}

fn reject_unknown_keys(updates: &Map<String, Value>, allowed: &[&str], what: &str) -> Result<()> {
    let unknown: Vec<&str> = updates
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(DroverError::UserError(format!(
        "unknown {}(s): {} (allowed: {})",
        what,
        unknown.join(", "),
        allowed.join(", ")
    )))
}

fn unknown_key(what: &str, key: &str) -> DroverError {
    DroverError::UserError(format!("unknown {}: {}", what, key))
}

fn invalid(key: &str, expected: &str) -> DroverError {
    DroverError::UserError(format!("'{}' must be {}", key, expected))
}

fn number(key: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| invalid(key, "a number"))
}

fn string(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, "a string"))
}

/// Accepts a JSON array of strings or a shell-style command line.
fn string_list(key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| string(key, v))
            .collect::<Result<Vec<_>>>(),
        Value::String(line) => shell_words::split(line)
            .map_err(|e| DroverError::UserError(format!("failed to parse '{}': {}", key, e))),
        _ => Err(invalid(key, "a list of strings")),
    }
}

fn string_map(key: &str, value: &Value) -> Result<BTreeMap<String, String>> {
    let Value::Object(map) = value else {
        return Err(invalid(key, "an object of strings"));
    };
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(invalid(key, "an object of strings")),
            };
            Ok((k.clone(), v))
        })
        .collect()
}
