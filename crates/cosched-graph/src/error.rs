//! Graph error types.

use thiserror::Error;

use cosched_core::JobState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The job set contains a cycle. Fatal at startup.
    #[error("invalid dependency graph: cycle through {}", .cycle.join(" -> "))]
    InvalidDependencyGraph { cycle: Vec<String> },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {job} cannot move from {from} to {to}")]
    IllegalTransition {
        job: String,
        from: JobState,
        to: JobState,
    },
}

pub type GraphResult<T> = Result<T, GraphError>;
