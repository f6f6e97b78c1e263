//! Per-tick snapshots and the end-of-run summary.

use std::collections::BTreeMap;

use serde::Serialize;

use cosched_core::{CorePartition, JobState, Timestamp};
use cosched_telemetry::TelemetrySample;

use crate::slo::SloVerdict;

/// Everything the controller knew at the end of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tick: u64,
    pub at: Timestamp,
    /// Last good sample, which may be older than this tick.
    pub telemetry: Option<TelemetrySample>,
    pub telemetry_fresh: bool,
    pub slo: SloVerdict,
    pub partition: CorePartition,
    pub jobs: BTreeMap<String, JobState>,
    /// Job → the failed prerequisite that blocks it.
    pub blocked: BTreeMap<String, String>,
}

/// Wall-clock accounting for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTiming {
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub paused_since: Option<Timestamp>,
    pub paused_total_ms: u64,
}

impl JobTiming {
    pub fn on_start(&mut self, now: Timestamp) {
        self.started_at.get_or_insert(now);
    }

    pub fn on_pause(&mut self, now: Timestamp) {
        self.paused_since.get_or_insert(now);
    }

    pub fn on_resume(&mut self, now: Timestamp) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total_ms += now.saturating_sub(since);
        }
    }

    pub fn on_end(&mut self, now: Timestamp) {
        self.on_resume(now);
        self.ended_at.get_or_insert(now);
    }

    /// Time spent running, excluding pauses. `None` until the job ends.
    pub fn run_time_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some(end.saturating_sub(start).saturating_sub(self.paused_total_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    /// A prerequisite failed.
    Blocked,
    /// Stopped by the drain before finishing.
    Stopped,
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub outcome: JobOutcome,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub run_time_ms: Option<u64>,
    pub paused_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// From the first job start to the last job end.
    pub makespan_ms: Option<u64>,
    pub breach_ticks: u64,
    pub forced_stops: usize,
    pub jobs: BTreeMap<String, JobSummary>,
}

impl RunSummary {
    pub fn count(&self, outcome: JobOutcome) -> usize {
        self.jobs.values().filter(|j| j.outcome == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_time_excludes_pauses() {
        let mut t = JobTiming::default();
        t.on_start(1_000);
        t.on_pause(2_000);
        t.on_pause(2_500);
        t.on_resume(3_000);
        assert_eq!(t.run_time_ms(), None);
        t.on_end(5_000);
        assert_eq!(t.paused_total_ms, 1_000);
        assert_eq!(t.run_time_ms(), Some(3_000));
    }

    #[test]
    fn ending_while_paused_closes_the_pause() {
        let mut t = JobTiming::default();
        t.on_start(0);
        t.on_pause(100);
        t.on_end(400);
        assert_eq!(t.paused_total_ms, 300);
        assert_eq!(t.run_time_ms(), Some(100));
        assert!(t.paused_since.is_none());
    }
}
