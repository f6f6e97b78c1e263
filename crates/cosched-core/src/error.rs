//! Error types for configuration loading and core partitioning.

use std::path::PathBuf;

use thiserror::Error;

use crate::cpuset::CoreSet;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Fatal, startup-only configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid cpuset: {0:?}")]
    InvalidCpuset(String),

    #[error("invalid job definition for {job:?}: {reason}")]
    InvalidJobDefinition { job: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn job(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidJobDefinition {
            job: job.into(),
            reason: reason.into(),
        }
    }
}

/// Violations of the partition's exact-cover invariant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cores {cores} are outside the inventory")]
    OutsideInventory { cores: CoreSet },

    #[error("cores {cores} are not held by {holder}")]
    NotHeld { cores: CoreSet, holder: String },

    #[error("core {core} is assigned more than once")]
    Overlap { core: u32 },

    #[error("cores {cores} are not assigned to anyone")]
    Uncovered { cores: CoreSet },
}
