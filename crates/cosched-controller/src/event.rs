//! Structured event records and the sinks that receive them.
//!
//! The controller emits one [`EventRecord`] per tick, one per error, and
//! bracketing records at start and finish. Sinks decide where they go; a
//! sink that fails to write is logged and skipped, never fatal to the loop.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use cosched_core::{CorePartition, CoreSet, ErrorKind, Timestamp, UnitId};

use crate::error::{ControllerError, ControllerResult};
use crate::snapshot::{RunSummary, Snapshot};

/// One line of the event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: Timestamp,
    pub tick: u64,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Started {
        inventory: CoreSet,
        service_cores: CoreSet,
        jobs: usize,
    },
    Tick {
        snapshot: Box<Snapshot>,
        actions: Vec<Action>,
    },
    Error {
        unit: Option<UnitId>,
        kind: ErrorKind,
        message: String,
    },
    DrainStarted {
        live_jobs: usize,
    },
    /// Every job unit is gone and holds no cores.
    Drained {
        actions: Vec<Action>,
        partition: CorePartition,
    },
    Finished {
        summary: RunSummary,
    },
}

/// Something the controller did during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    JobReady { job: String },
    JobStarted { job: String, cores: CoreSet },
    JobCompleted { job: String },
    JobFailed { job: String, reason: String },
    JobBlocked { job: String, failed_prerequisite: String },
    JobPaused { job: String },
    JobResumed { job: String, cores: CoreSet },
    CoresReassigned { unit: UnitId, cores: CoreSet },
    ServiceGrew { cores: CoreSet },
    ServiceShrank { cores: CoreSet },
    JobStopped { job: String, forced: bool },
}

pub trait EventSink: Send {
    fn record(&mut self, record: &EventRecord) -> ControllerResult<()>;
}

/// Appends one JSON object per line and flushes after each.
pub struct JsonLinesLog {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonLinesLog {
    pub fn open(path: impl AsRef<Path>) -> ControllerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ControllerError::EventLog {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesLog {
    fn record(&mut self, record: &EventRecord) -> ControllerResult<()> {
        let line = serde_json::to_string(record)?;
        let io = |source| ControllerError::EventLog {
            path: self.path.clone(),
            source,
        };
        writeln!(self.out, "{line}").map_err(io)?;
        self.out.flush().map_err(io)
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every error record's kind, in order.
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.records()
            .into_iter()
            .filter_map(|r| match r.event {
                Event::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Every action from every tick, in order.
    pub fn actions(&self) -> Vec<Action> {
        self.records()
            .into_iter()
            .filter_map(|r| match r.event {
                Event::Tick { actions, .. } => Some(actions),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&mut self, record: &EventRecord) -> ControllerResult<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record.clone());
        Ok(())
    }
}

/// Default sink: events go to the debug log only.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&mut self, record: &EventRecord) -> ControllerResult<()> {
        match &record.event {
            Event::Tick { actions, .. } => {
                debug!(tick = record.tick, actions = actions.len(), "tick recorded")
            }
            other => debug!(tick = record.tick, event = ?other, "event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_appended_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        for tick in 0..2 {
            let mut log = JsonLinesLog::open(&path).unwrap();
            log.record(&EventRecord {
                at: 1_000 + tick,
                tick,
                event: Event::Error {
                    unit: Some(UnitId::job("dedup")),
                    kind: ErrorKind::LaunchError,
                    message: "image not found".into(),
                },
            })
            .unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["tick"], 1);
        assert_eq!(lines[0]["event"], "error");
        assert_eq!(lines[0]["kind"], "launch_error");
        assert_eq!(lines[0]["unit"]["name"], "dedup");
    }

    #[test]
    fn actions_serialize_with_cpuset_strings() {
        let action = Action::JobStarted {
            job: "ferret".into(),
            cores: CoreSet::from([1, 2, 3]),
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["action"], "job_started");
        assert_eq!(v["cores"], "1-3");
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer
            .record(&EventRecord {
                at: 0,
                tick: 0,
                event: Event::DrainStarted { live_jobs: 2 },
            })
            .unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
