//! Executor error types.

use std::time::Duration;

use cosched_core::{ErrorKind, UnitId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to launch {unit}: {reason}")]
    Launch { unit: UnitId, reason: String },

    #[error("core reassignment of {unit} timed out after {timeout:?}")]
    ReassignTimeout { unit: UnitId, timeout: Duration },

    #[error("{0} is unresponsive")]
    Unresponsive(UnitId),

    #[error("{op} on {unit} timed out after {timeout:?}")]
    Timeout {
        unit: UnitId,
        op: &'static str,
        timeout: Duration,
    },

    #[error("{op} on {unit} failed: {reason}")]
    Runtime {
        unit: UnitId,
        op: &'static str,
        reason: String,
    },

    #[error("unknown unit: {0}")]
    UnknownUnit(UnitId),

    #[error("{0} is not supported by this runtime")]
    Unsupported(&'static str),
}

impl ExecutorError {
    pub(crate) fn runtime(unit: &UnitId, op: &'static str, reason: impl ToString) -> Self {
        ExecutorError::Runtime {
            unit: unit.clone(),
            op,
            reason: reason.to_string(),
        }
    }

    /// Event-log classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Launch { .. } => ErrorKind::LaunchError,
            ExecutorError::ReassignTimeout { .. } | ExecutorError::Unresponsive(_) => {
                ErrorKind::ReassignTimeout
            }
            _ => ErrorKind::ExecutorFailure,
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresponsive_names_the_unit() {
        let err = ExecutorError::Unresponsive(UnitId::job("dedup"));
        assert_eq!(err.to_string(), "job:dedup is unresponsive");
        assert_eq!(err.kind(), ErrorKind::ReassignTimeout);
    }
}
