//! cosched-executor — the only place that touches processes and affinity.
//!
//! ```text
//! WorkloadExecutor (records: cores, paused, unresponsive; call timeouts)
//!   ├── jobs    → Arc<dyn UnitRuntime>   ProcessRuntime | DockerRuntime
//!   └── service → Arc<dyn UnitRuntime>   ProcessRuntime (attached by pid)
//! ```
//!
//! The executor owns no policy. It never changes a unit on its own; the
//! control loop decides and calls in.

pub mod docker;
pub mod error;
pub mod executor;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod process;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{StopOutcome, StopReport, Timeouts, UnitHandle, WorkloadExecutor};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockCall, MockRuntime};
pub use process::ProcessRuntime;
pub use runtime::{LaunchSpec, UnitRuntime};
