//! Controller error types.

use std::path::PathBuf;

use thiserror::Error;

use cosched_core::{ConfigError, PartitionError};
use cosched_executor::ExecutorError;
use cosched_graph::GraphError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("core partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("event log {path}: {source}")]
    EventLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
