use super::*;
use crate::agent::{AgentHandle, ProcessManager};
use crate::config::AgentLogLevel;
use crate::control::ControlRequest;
use crate::events::Event;
use crate::plugins::test_plugins::ScriptedPlugin;
use crate::plugins::{PluginRegistry, Reduction};
use crate::runtime::SegmentPipeline;
use crate::segment::CooldownTimer;
use crate::sink::SinkSet;
use crate::sink::memory::MemorySink;
use crate::test_support::{
    COOPERATIVE_AGENT, CRASHING_AGENT, PARTIAL_AGENT, STUBBORN_AGENT, TestWorkspace, wait_until,
};
use crossbeam::channel::bounded;
use serde_json::{Map, Value, json};
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn pipeline() -> (SegmentPipeline, Arc<Mutex<Vec<Value>>>) {
    let sink = MemorySink::new();
    let records = sink.records();
    let mut sinks = SinkSet::new();
    sinks.push(Box::new(sink));
    let pipeline = SegmentPipeline::new(PluginRegistry::new(), CooldownTimer::new(1.0).unwrap(), sinks);
    (pipeline, records)
}

fn spawn(ws: &mut TestWorkspace, label: &str, body: &str) -> AgentHandle {
    let agent = ws.add_agent(label, body);
    ProcessManager::from_config(&ws.config).spawn(label, &agent).unwrap()
}

fn sequencer() -> ShutdownSequencer {
    ShutdownSequencer::new(Duration::from_millis(500), Duration::from_millis(200))
}

fn context<'a>(
    agents: &'a mut BTreeMap<String, AgentHandle>,
    pipeline: &'a mut SegmentPipeline,
) -> ShutdownContext<'a> {
    ShutdownContext {
        agents,
        pipeline,
        agent_log_level: AgentLogLevel::Info,
        control: None,
        server: None,
    }
}

fn events_named(records: &Arc<Mutex<Vec<Value>>>, name: &str) -> Vec<Value> {
    records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r["e"] == name)
        .cloned()
        .collect()
}

#[test]
#[serial]
fn cooperative_agent_shuts_down_cleanly() {
    let mut ws = TestWorkspace::new();
    let mut agents = BTreeMap::new();
    agents.insert("keys".to_string(), spawn(&mut ws, "keys", COOPERATIVE_AGENT));
    let (mut pipeline, records) = pipeline();

    let report = sequencer().run(context(&mut agents, &mut pipeline));

    assert!(report.is_clean(), "{:?}", report);
    let keys = report.agent("keys").unwrap();
    assert_eq!(keys.phase, ShutdownPhase::Done);
    assert!(keys.delivered);
    assert_eq!(keys.exit_code, Some(0));

    let summaries = events_named(&records, "summary");
    assert!(summaries.iter().any(|r| r["payload"]["data"]["final"] == true));
    assert!(events_named(&records, "shutdown_missing_ack").is_empty());
}

#[test]
#[serial]
fn partial_agent_reports_each_missing_signal() {
    let mut ws = TestWorkspace::new();
    let mut agents = BTreeMap::new();
    agents.insert("mouse".to_string(), spawn(&mut ws, "mouse", PARTIAL_AGENT));
    let (mut pipeline, records) = pipeline();

    let report = sequencer().run(context(&mut agents, &mut pipeline));

    let mouse = report.agent("mouse").unwrap();
    assert_eq!(mouse.phase, ShutdownPhase::TimedOut);
    assert_eq!(mouse.reached, ShutdownPhase::FlushAcked);
    assert_eq!(
        mouse.missing,
        vec![ShutdownSignal::Summary, ShutdownSignal::ShutdownAck]
    );
    assert!(mouse.forced);
    assert_eq!(report.missing_total(), 2);
    assert_eq!(report.forced_kills(), 1);

    let missing: Vec<Value> = events_named(&records, "shutdown_missing_ack")
        .into_iter()
        .map(|r| r["payload"]["signal"].clone())
        .collect();
    assert_eq!(missing, vec![json!("summary"), json!("shutdown_ack")]);
}

#[test]
#[serial]
fn stubborn_agent_is_killed_after_the_deadline() {
    let mut ws = TestWorkspace::new();
    let mut agents = BTreeMap::new();
    agents.insert("stubborn".to_string(), spawn(&mut ws, "stubborn", STUBBORN_AGENT));
    let (mut pipeline, _records) = pipeline();

    let report = sequencer().run(context(&mut agents, &mut pipeline));

    let stubborn = report.agent("stubborn").unwrap();
    assert_eq!(stubborn.reached, ShutdownPhase::SequenceSent);
    assert_eq!(stubborn.missing.len(), 4);
    assert!(stubborn.forced);
    assert!(!agents.get_mut("stubborn").unwrap().is_alive());
}

#[test]
#[serial]
fn exited_agent_resolves_without_waiting_for_the_deadline() {
    let mut ws = TestWorkspace::new();
    let mut handle = spawn(&mut ws, "crashy", CRASHING_AGENT);
    assert!(wait_until(Duration::from_secs(2), || !handle.is_alive()));
    let mut agents = BTreeMap::new();
    agents.insert("crashy".to_string(), handle);
    let (mut pipeline, _records) = pipeline();

    let sequencer = ShutdownSequencer::new(Duration::from_secs(30), Duration::from_millis(200));
    let report = sequencer.run(context(&mut agents, &mut pipeline));

    let crashy = report.agent("crashy").unwrap();
    assert!(!crashy.delivered);
    assert!(!crashy.forced);
    assert_eq!(crashy.exit_code, Some(3));
    assert_eq!(crashy.missing.len(), 4);
    assert!(report.elapsed_s < 5.0);
}

#[test]
#[serial]
fn mixed_agents_are_tracked_independently() {
    let mut ws = TestWorkspace::new();
    let mut agents = BTreeMap::new();
    agents.insert("keys".to_string(), spawn(&mut ws, "keys", COOPERATIVE_AGENT));
    agents.insert("mouse".to_string(), spawn(&mut ws, "mouse", PARTIAL_AGENT));
    let (mut pipeline, _records) = pipeline();

    let report = sequencer().run(context(&mut agents, &mut pipeline));

    assert!(!report.is_clean());
    assert!(report.agent("keys").unwrap().missing.is_empty());
    assert!(!report.agent("keys").unwrap().forced);
    assert_eq!(report.agent("mouse").unwrap().missing.len(), 2);
}

#[test]
fn queued_control_requests_are_rejected() {
    let (tx, rx) = bounded(4);
    let (reply_tx, reply_rx) = bounded(1);
    tx.send(ControlRequest::new("status".to_string(), Map::new(), reply_tx)).unwrap();

    let mut agents = BTreeMap::new();
    let (mut pipeline, _records) = pipeline();
    let report = sequencer().run(ShutdownContext {
        agents: &mut agents,
        pipeline: &mut pipeline,
        agent_log_level: AgentLogLevel::Info,
        control: Some(&rx),
        server: None,
    });

    assert_eq!(report.rejected_requests, 1);
    assert_eq!(
        reply_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err("orchestrator is shutting down".to_string())
    );
}

#[test]
fn open_segment_is_closed_and_sinks_are_closed() {
    let (mut pipeline, records) = pipeline();
    let plugin = ScriptedPlugin::new("keyboard", Some("key"), Reduction::Count);
    pipeline.plugins.register(Box::new(plugin)).unwrap();
    pipeline.ingest(Event::new("keyboard", "press").with_payload(json!({"key": "a"})));

    let mut agents = BTreeMap::new();
    let report = sequencer().run(context(&mut agents, &mut pipeline));

    assert!(report.segment_closed);
    assert!(report.is_clean());
    let segments: Vec<Value> = records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r["type"] == "segment")
        .cloned()
        .collect();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0]["aggregated"]["key"], 1);

    // Closed sinks refuse further writes.
    let before = records.lock().unwrap().len();
    pipeline.write_event(&Event::new("keyboard", "late"));
    assert_eq!(records.lock().unwrap().len(), before);
}
