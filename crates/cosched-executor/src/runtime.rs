//! The capability set a unit runtime must provide.

use async_trait::async_trait;

use cosched_core::{CoreSet, JobSpec, UnitId, UnitStatus};

use crate::error::ExecutorResult;

/// Everything needed to create a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub unit: UnitId,
    pub cores: CoreSet,
    pub threads: u32,
    /// Fully rendered command line.
    pub command: Vec<String>,
    pub image: Option<String>,
}

impl LaunchSpec {
    /// Launch spec for a batch job pinned to `cores`.
    pub fn for_job(job: &JobSpec, cores: &CoreSet) -> Self {
        Self {
            unit: UnitId::job(&job.name),
            cores: cores.clone(),
            threads: job.threads,
            command: job.render_command(cores),
            image: job.image.clone(),
        }
    }
}

/// Process or container control for isolated units.
///
/// Implementations keep their own table of live units keyed by [`UnitId`].
/// Calls are not bounded here; [`WorkloadExecutor`](crate::WorkloadExecutor)
/// wraps every one of them in a timeout.
#[async_trait]
pub trait UnitRuntime: Send + Sync {
    /// Create and start the unit pinned to `spec.cores`.
    async fn launch(&self, spec: &LaunchSpec) -> ExecutorResult<()>;

    /// Adopt an already-running process.
    async fn attach(&self, unit: &UnitId, pid: u32) -> ExecutorResult<()>;

    /// Replace the unit's affinity mask without restarting it.
    async fn set_affinity(&self, unit: &UnitId, cores: &CoreSet) -> ExecutorResult<()>;

    async fn pause(&self, unit: &UnitId) -> ExecutorResult<()>;

    async fn resume(&self, unit: &UnitId) -> ExecutorResult<()>;

    /// Ask the unit to exit (SIGTERM or equivalent).
    async fn signal_stop(&self, unit: &UnitId) -> ExecutorResult<()>;

    /// Force termination.
    async fn kill(&self, unit: &UnitId) -> ExecutorResult<()>;

    /// Point-in-time status. Never returns `Unresponsive`; the executor
    /// decides that from timeouts.
    async fn status(&self, unit: &UnitId) -> ExecutorResult<UnitStatus>;

    async fn pid(&self, unit: &UnitId) -> Option<u32>;

    /// Drop whatever the runtime still holds for an exited unit.
    async fn release(&self, unit: &UnitId) -> ExecutorResult<()>;

    fn name(&self) -> &'static str;
}
