//! Tests for config functionality.

use crate::config::{AgentConfig, AgentLogLevel, Config, SegmentSourceConfig, is_valid_label};
use crate::plugins::Reduction;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use tempfile::TempDir;

fn updates(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn config_with_agent(label: &str) -> Config {
    let mut config = Config::default();
    config.agents.insert(
        label.to_string(),
        AgentConfig {
            executable: "keys/agent.sh".to_string(),
            ..Default::default()
        },
    );
    config
}

#[test]
fn test_default_config() {
    let config = Config::default();

    assert_eq!(config.cooldown_seconds, 10.0);
    assert_eq!(config.poll_tick_s, 0.5);
    assert_eq!(config.shutdown_timeout_s, 10.0);
    assert_eq!(config.drain_timeout_s, 2.0);
    assert_eq!(config.agent_log_level, AgentLogLevel::Info);
    assert_eq!(config.state_dir, ".drover");
    assert!(config.agents.is_empty());
    assert!(config.source().is_none());
}

#[test]
fn test_parse_minimal_yaml() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.cooldown_seconds, 10.0);
    assert_eq!(config.plugins_root, "plugins");
}

#[test]
fn test_parse_full_yaml() {
    let yaml = r#"
cooldown_seconds: 3.5
poll_tick_s: 0.25
shutdown_timeout_s: 4
drain_timeout_s: 1
agent_log_level: debug
state_dir: /var/lib/drover
socket_path: /run/drover.sock
plugins_root: /opt/plugins
templates_root: /opt/templates
output_path: /var/lib/drover/out.jsonl
agents:
  keys:
    executable: keys/agent.py
    interpreter: python3 -u
    args: ["--fast"]
    env:
      MODE: test
    heartbeat_interval_s: 2
    agent_flush_interval_s: 0.5
  mouse:
    enabled: false
    template_id: mouse
    executable: mouse/agent.sh
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.cooldown_seconds, 3.5);
    assert_eq!(config.agent_log_level, AgentLogLevel::Debug);
    assert_eq!(config.socket_path(), PathBuf::from("/run/drover.sock"));
    assert_eq!(config.output_path(), PathBuf::from("/var/lib/drover/out.jsonl"));

    let keys = &config.agents["keys"];
    assert!(keys.enabled);
    assert_eq!(keys.interpreter.as_deref(), Some("python3 -u"));
    assert_eq!(keys.args, vec!["--fast"]);
    assert_eq!(keys.env["MODE"], "test");
    assert_eq!(keys.heartbeat_interval_s, 2.0);

    let mouse = &config.agents["mouse"];
    assert!(!mouse.enabled);
    assert_eq!(mouse.template_id.as_deref(), Some("mouse"));
    assert_eq!(mouse.agent_flush_interval_s, 1.0);
}

#[test]
fn test_unknown_fields_are_ignored() {
    let yaml = r#"
cooldown_seconds: 2
future_setting: true
agents:
  a:
    executable: a.sh
    future_agent_field: 1
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.cooldown_seconds, 2.0);
    assert_eq!(config.agents["a"].executable, "a.sh");
}

#[test]
fn test_validation_rejects_bad_values() {
    for yaml in [
        "cooldown_seconds: 0",
        "cooldown_seconds: -1",
        "poll_tick_s: 0",
        "shutdown_timeout_s: -2",
        "agents:\n  a:\n    executable: \"\"",
        "agents:\n  a:\n    executable: a.sh\n    heartbeat_interval_s: 0",
        "agents:\n  \"-bad\":\n    executable: a.sh",
    ] {
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(
            err.to_string().contains("config validation failed"),
            "{}: {}",
            yaml,
            err
        );
    }
}

#[test]
fn test_invalid_yaml_is_a_user_error() {
    let err = Config::from_yaml("cooldown_seconds: [").unwrap_err();
    assert!(err.to_string().contains("failed to parse config YAML"));
    assert_eq!(err.exit_code(), crate::exit_codes::USER_ERROR);
}

#[test]
fn test_relative_paths_resolve_against_config_dir() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("drover.yaml");
    std::fs::write(&path, "state_dir: state\nplugins_root: ../plugins\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.state_dir(), temp_dir.path().join("state"));
    assert_eq!(config.plugins_root(), temp_dir.path().join("../plugins"));
    assert_eq!(
        config.socket_path(),
        temp_dir.path().join("state").join("control.sock")
    );
    assert_eq!(
        config.output_path(),
        temp_dir.path().join("state/output/segments.jsonl")
    );
    assert_eq!(config.logs_dir(), temp_dir.path().join("state/logs"));
}

#[test]
fn test_load_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = Config::load(temp_dir.path().join("missing.yaml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn test_load_or_default_then_save_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("drover.yaml");

    let mut config = Config::load_or_default(&path).unwrap();
    assert!(!path.exists());
    config.cooldown_seconds = 7.0;
    config.agents.insert(
        "keys".to_string(),
        AgentConfig {
            executable: "keys/agent.sh".to_string(),
            ..Default::default()
        },
    );
    config.save().unwrap();

    let reloaded = Config::load(&path).unwrap();
    assert_eq!(reloaded.cooldown_seconds, 7.0);
    assert_eq!(reloaded.agents["keys"], config.agents["keys"]);
}

#[test]
fn test_settings_update_applies_all_keys() {
    let mut config = Config::default();
    let changed = config
        .apply_settings(&updates(json!({
            "cooldown_seconds": 4,
            "agent_log_level": "WARNING",
            "drain_timeout_s": 2.0,
        })))
        .unwrap();

    assert_eq!(config.cooldown_seconds, 4.0);
    assert_eq!(config.agent_log_level, AgentLogLevel::Warn);
    assert_eq!(changed, vec!["cooldown_seconds", "agent_log_level"]);
}

#[test]
fn test_settings_update_is_all_or_nothing() {
    let mut config = Config::default();

    let err = config
        .apply_settings(&updates(json!({"cooldown_seconds": 3, "state_dir": "/tmp"})))
        .unwrap_err();
    assert!(err.to_string().contains("state_dir"));
    assert_eq!(config.cooldown_seconds, 10.0);

    let err = config
        .apply_settings(&updates(json!({"cooldown_seconds": 3, "poll_tick_s": 0})))
        .unwrap_err();
    assert!(err.to_string().contains("poll_tick_s"));
    assert_eq!(config.cooldown_seconds, 10.0);

    assert!(
        config
            .apply_settings(&updates(json!({"agent_log_level": "loud"})))
            .is_err()
    );
    assert_eq!(config.agent_log_level, AgentLogLevel::Info);
}

#[test]
fn test_agent_update_detects_restart_and_enable_flip() {
    let mut config = config_with_agent("keys");

    let update = config
        .apply_agent_updates(
            "keys",
            &updates(json!({"args": "--verbose --rate 5", "heartbeat_interval_s": 5})),
        )
        .unwrap();
    assert_eq!(update.changed, vec!["args"]);
    assert!(update.needs_restart);
    assert_eq!(update.enabled_changed, None);
    assert_eq!(config.agents["keys"].args, vec!["--verbose", "--rate", "5"]);

    let update = config
        .apply_agent_updates("keys", &updates(json!({"enabled": false})))
        .unwrap();
    assert_eq!(update.enabled_changed, Some(false));
    assert!(!update.needs_restart);
}

#[test]
fn test_agent_update_rejects_unknown_keys_atomically() {
    let mut config = config_with_agent("keys");
    let before = config.agents["keys"].clone();

    let err = config
        .apply_agent_updates("keys", &updates(json!({"enabled": false, "pid": 4})))
        .unwrap_err();
    assert!(err.to_string().contains("pid"));
    assert_eq!(config.agents["keys"], before);

    assert!(
        config
            .apply_agent_updates("missing", &updates(json!({"enabled": false})))
            .is_err()
    );
}

#[test]
fn test_allocate_label_is_collision_free() {
    let mut config = Config::default();
    assert_eq!(config.allocate_label("x"), "x");

    for _ in 0..3 {
        let label = config.allocate_label("x");
        config.agents.insert(
            label,
            AgentConfig {
                executable: "x.sh".to_string(),
                ..Default::default()
            },
        );
    }
    let mut labels: Vec<&String> = config.agents.keys().collect();
    labels.sort();
    assert_eq!(labels, vec!["x", "x-2", "x-3"]);
    assert_eq!(config.allocate_label("x"), "x-4");
    assert_eq!(config.allocate_label("not valid!"), "agent");
}

#[test]
fn test_label_pattern() {
    assert!(is_valid_label("keys"));
    assert!(is_valid_label("Keys_2.v-1"));
    assert!(!is_valid_label(""));
    assert!(!is_valid_label("-keys"));
    assert!(!is_valid_label("keys/agent"));
    assert!(!is_valid_label(&"a".repeat(65)));
    assert!(is_valid_label(&"a".repeat(64)));
}

#[test]
fn test_parse_segment_sources() {
    let yaml = r#"
agents:
  keys:
    executable: keys/agent.sh
segment_sources:
  typing:
    agent: keys
    data_header: count
    reduction: sum
  presence:
    agent: keys
    resetting: false
"#;
    let config = Config::from_yaml(yaml).unwrap();
    config.validate().unwrap();

    let typing = &config.segment_sources["typing"];
    assert_eq!(typing.data_header.as_deref(), Some("count"));
    assert_eq!(typing.reduction, Reduction::Sum);
    assert!(typing.resetting);

    let presence = &config.segment_sources["presence"];
    assert!(!presence.resetting);
    assert_eq!(presence.reduction, Reduction::Concat);
    assert_eq!(config.sources_fed_by("keys"), vec!["presence", "typing"]);
}

#[test]
fn test_segment_source_validation() {
    let source = |agent: &str, header: Option<&str>| SegmentSourceConfig {
        agent: agent.to_string(),
        data_header: header.map(str::to_string),
        resetting: true,
        reduction: Reduction::Count,
    };

    let mut config = config_with_agent("keys");
    config.segment_sources.insert("typing".to_string(), source("ghost", None));
    assert!(config.validate().unwrap_err().to_string().contains("unknown agent 'ghost'"));

    let mut config = config_with_agent("keys");
    config.segment_sources.insert("keys".to_string(), source("keys", None));
    assert!(config.validate().unwrap_err().to_string().contains("clashes"));

    let mut config = config_with_agent("keys");
    config.segment_sources.insert("typing".to_string(), source("keys", Some(" ")));
    assert!(config.validate().is_err());

    let mut config = config_with_agent("keys");
    config.segment_sources.insert("typing".to_string(), source("keys", Some("count")));
    config.validate().unwrap();
    assert_eq!(config.allocate_label("typing"), "typing-2");
}
