//! Telemetry error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("stats endpoint {addr} unreachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stats query to {addr} timed out after {timeout:?}")]
    StatsTimeout { addr: String, timeout: Duration },

    #[error("sample abandoned after exceeding its {0:?} budget")]
    BudgetExceeded(Duration),

    #[error("host reader task failed: {0}")]
    Task(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
