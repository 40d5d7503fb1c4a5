//! Implementation of `drover run`.

use crate::cli::RunArgs;
use crate::config::Config;
use crate::control::ControlServer;
use crate::error::{DroverError, Result};
use crate::locks;
use crate::logging;
use crate::runtime::Orchestrator;
use crate::shutdown::ShutdownReport;
use crate::signals::{self, StopSignal};
use crate::sink::JsonlSink;
use tracing::{error, info, warn};

/// Run the orchestrator until stopped, then shut it down in order.
pub fn cmd_run(args: RunArgs) -> Result<()> {
    logging::init(args.verbose)?;

    let config = Config::load_or_default(&args.config)?;
    config.validate()?;

    signals::install_handlers();
    let report = serve(config, StopSignal::with_os_signals(), args.once)?;
    if let Some(signal) = signals::last_signal() {
        info!(signal, "stop requested by signal");
    }
    info!(elapsed_s = report.elapsed_s, "drover stopped");
    Ok(())
}

/// Everything `run` does after the config is loaded.
///
/// The singleton lock is held for the whole run. A control socket that
/// cannot be bound is logged and the orchestrator runs headless.
pub fn serve(config: Config, stop: StopSignal, once: bool) -> Result<ShutdownReport> {
    let lock = locks::acquire_instance_lock(&config.lock_path(), "run")?;

    let socket_path = config.socket_path();
    let output_path = config.output_path();
    let mut orchestrator = Orchestrator::new(config, stop.clone())?;

    let sink = JsonlSink::open(&output_path).map_err(|e| {
        DroverError::RuntimeError(format!(
            "failed to open output '{}': {}",
            output_path.display(),
            e
        ))
    })?;
    orchestrator.add_sink(Box::new(sink));

    let server = match ControlServer::start(&socket_path, stop) {
        Ok((server, requests)) => {
            orchestrator.attach_control(requests);
            Some(server)
        }
        Err(e) => {
            error!(error = %e, "control plane unavailable, running headless");
            None
        }
    };

    orchestrator.run(once);

    let report = orchestrator.shutdown(server);
    for agent in report.agents.iter().filter(|a| !a.missing.is_empty() || a.forced) {
        warn!(
            agent = %agent.label,
            reached = agent.reached.as_str(),
            missing = agent.missing.len(),
            forced = agent.forced,
            "agent did not shut down cleanly"
        );
    }

    if let Err(e) = lock.release() {
        warn!(error = %e, "failed to release instance lock");
    }
    Ok(report)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SegmentSourceConfig;
    use crate::plugins::Reduction;
    use crate::test_support::{COOPERATIVE_AGENT, TestWorkspace};
    use serde_json::Value;
    use serial_test::serial;
    use std::thread;
    use std::time::Duration;

    fn read_records(config: &Config) -> Vec<Value> {
        std::fs::read_to_string(config.output_path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    #[serial]
    fn agent_summaries_produce_segment_records() {
        let mut ws = TestWorkspace::new();
        ws.config.cooldown_seconds = 0.2;
        ws.add_agent("keys", COOPERATIVE_AGENT);
        ws.config.segment_sources.insert(
            "activity".to_string(),
            SegmentSourceConfig {
                agent: "keys".to_string(),
                data_header: Some("count".to_string()),
                resetting: true,
                reduction: Reduction::Sum,
            },
        );
        let config = ws.config.clone();

        let stop = StopSignal::new();
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(800));
                stop.request_stop();
            })
        };
        let report = serve(config.clone(), stop, false).unwrap();
        stopper.join().unwrap();

        assert!(report.is_clean(), "{:?}", report);
        let records = read_records(&config);
        let segments: Vec<&Value> = records.iter().filter(|r| r["type"] == "segment").collect();
        assert!(!segments.is_empty());
        assert!(segments[0]["aggregated"]["count"].as_i64().unwrap() >= 1);
        assert!(
            records
                .iter()
                .any(|r| r["l"] == "activity" && r["e"] == "summary")
        );
        assert!(!config.lock_path().exists());
    }

    #[test]
    #[serial]
    fn second_instance_is_refused_by_the_lock() {
        let ws = TestWorkspace::new();
        let lock = locks::acquire_instance_lock(&ws.config.lock_path(), "run").unwrap();

        let err = serve(ws.config.clone(), StopSignal::new(), true).unwrap_err();
        assert!(matches!(err, DroverError::LockError(_)));
        lock.release().unwrap();
    }
}
