//! cosched-core — shared types for the co-location scheduler.
//!
//! Every other cosched crate depends on this one for:
//!
//! - [`CoreSet`]: an ordered set of core ids with cpuset-string parsing
//! - [`CorePartition`]: the exact-cover split of the host's cores between
//!   the latency-critical service, the batch jobs, and idle
//! - [`JobSpec`] / [`JobSet`]: the declarative batch workload definition
//! - [`CoschedConfig`]: the TOML configuration file

pub mod config;
pub mod cpuset;
pub mod duration;
pub mod error;
pub mod jobs;
pub mod partition;
pub mod types;

pub use config::CoschedConfig;
pub use cpuset::{CoreId, CoreSet};
pub use error::{ConfigError, ConfigResult, PartitionError};
pub use jobs::{JobSet, JobSpec};
pub use partition::{CorePartition, Holder};
pub use types::*;
