//! Shared types used across cosched crates.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    /// Completed or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Running or Paused: a live process exists for the job.
    pub fn is_live(self) -> bool {
        matches!(self, JobState::Running | JobState::Paused)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A schedulable unit: the latency-critical service or one batch job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum UnitId {
    Service,
    Job(String),
}

impl UnitId {
    pub fn job(name: impl Into<String>) -> Self {
        UnitId::Job(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            UnitId::Service => "service",
            UnitId::Job(name) => name,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Service => f.write_str("service"),
            UnitId::Job(name) => write!(f, "job:{name}"),
        }
    }
}

/// Point-in-time liveness of a unit as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum UnitStatus {
    Running,
    Paused,
    Exited(i32),
    Unresponsive,
}

/// Error taxonomy recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TelemetryUnavailable,
    LaunchError,
    ReassignTimeout,
    InvalidDependencyGraph,
    InvalidJobDefinition,
    ShutdownTimeout,
    ExecutorFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TelemetryUnavailable => "telemetry_unavailable",
            ErrorKind::LaunchError => "launch_error",
            ErrorKind::ReassignTimeout => "reassign_timeout",
            ErrorKind::InvalidDependencyGraph => "invalid_dependency_graph",
            ErrorKind::InvalidJobDefinition => "invalid_job_definition",
            ErrorKind::ShutdownTimeout => "shutdown_timeout",
            ErrorKind::ExecutorFailure => "executor_failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_live_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(JobState::Paused.is_live());
        assert!(!JobState::Ready.is_live());
    }

    #[test]
    fn unit_id_serializes_tagged() {
        let json = serde_json::to_string(&UnitId::job("dedup")).unwrap();
        assert_eq!(json, r#"{"kind":"job","name":"dedup"}"#);
        let json = serde_json::to_string(&UnitId::Service).unwrap();
        assert_eq!(json, r#"{"kind":"service"}"#);
    }

    #[test]
    fn epoch_millis_returns_reasonable_value() {
        // After 2024-01-01.
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}
