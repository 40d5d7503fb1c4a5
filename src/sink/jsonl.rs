//! JSON-lines file sink.
//!
//! Appends one canonical record per line to a single file, creating parent
//! directories on open. Each write is flushed to the OS; `flush` additionally
//! syncs the file to disk.

use super::Sink;
use crate::error::SinkError;
use crate::events::{Event, Segment};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const SINK_NAME: &str = "jsonl";

pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    /// Open (or create) the output file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| io_error(&path, "create directory", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, "open", e))?;

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &Value) -> Result<(), SinkError> {
        let line = serde_json::to_string(record).map_err(|e| SinkError::Serialize(e.to_string()))?;
        let path = self.path.clone();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkError::Closed(SINK_NAME.to_string()))?;

        writeln!(writer, "{}", line).map_err(|e| io_error(&path, "write", e))?;
        writer.flush().map_err(|e| io_error(&path, "flush", e))?;
        Ok(())
    }
}

fn io_error(path: &Path, op: &str, e: std::io::Error) -> SinkError {
    SinkError::Io {
        sink: SINK_NAME.to_string(),
        reason: format!("failed to {} '{}': {}", op, path.display(), e),
    }
}

impl Sink for JsonlSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError> {
        self.append(&segment.to_record())
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError> {
        self.append(&event.to_record())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let path = self.path.clone();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| io_error(&path, "flush", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| io_error(&path, "sync", e))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn writes_canonical_segment_shape() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("output").join("segments.jsonl");
        let mut sink = JsonlSink::open(&path).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let events = vec![Event::at(start, "keys", "press").to_ref()];
        let mut aggregated = Map::new();
        aggregated.insert("items".to_string(), json!(["a"]));
        let segment = Segment::new(start, start + Duration::seconds(4), events, aggregated, 1);

        sink.write_segment(&segment).unwrap();
        sink.close().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        let record = &lines[0];
        let mut keys: Vec<&str> = record.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "aggregated",
                "duration_s",
                "end",
                "events",
                "labels",
                "resets_count",
                "start",
                "type"
            ]
        );
        assert_eq!(record["duration_s"], 4.0);
        assert_eq!(record["events"][0], json!({"t": "2024-03-01T08:00:00Z", "l": "keys", "e": "press"}));
    }

    #[test]
    fn appends_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segments.jsonl");

        let mut first = JsonlSink::open(&path).unwrap();
        first.write_event(&Event::new("a", "summary")).unwrap();
        first.close().unwrap();

        let mut second = JsonlSink::open(&path).unwrap();
        second
            .write_event(&Event::new("b", "agent_exited").with_payload(json!({"exit_code": 1})))
            .unwrap();
        second.flush().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["l"], "a");
        assert_eq!(lines[1]["payload"]["exit_code"], 1);
        assert_eq!(lines[1]["type"], "event");
    }

    #[test]
    fn writes_after_close_fail() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::open(temp_dir.path().join("out.jsonl")).unwrap();
        sink.close().unwrap();

        let err = sink.write_event(&Event::new("a", "x")).unwrap_err();
        assert_eq!(err, SinkError::Closed("jsonl".to_string()));
        assert!(sink.close().is_ok());
    }
}
