//! The workload executor.
//!
//! Wraps a [`UnitRuntime`] with the bookkeeping the control loop relies on:
//! which cores each unit is pinned to, whether it is paused, and whether it
//! has stopped answering. Every runtime call is bounded by a timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use cosched_core::config::ExecutorConfig;
use cosched_core::{CoreSet, UnitId, UnitStatus};

use crate::error::{ExecutorError, ExecutorResult};
use crate::runtime::{LaunchSpec, UnitRuntime};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the caller holds for a started unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub unit: UnitId,
    pub pid: Option<u32>,
}

/// How a stopped unit went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period.
    Graceful(i32),
    /// Killed after the grace period elapsed.
    Forced,
}

/// Result of stopping several units together.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub outcomes: BTreeMap<UnitId, StopOutcome>,
}

impl StopReport {
    pub fn forced(&self) -> Vec<&UnitId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == StopOutcome::Forced)
            .map(|(u, _)| u)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct UnitRecord {
    cores: CoreSet,
    pid: Option<u32>,
    paused: bool,
    unresponsive: bool,
    exited: Option<i32>,
}

/// Call timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub call: Duration,
    pub launch: Duration,
}

impl From<&ExecutorConfig> for Timeouts {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            call: config.call_timeout,
            launch: config.launch_timeout,
        }
    }
}

pub struct WorkloadExecutor {
    jobs: Arc<dyn UnitRuntime>,
    service: Arc<dyn UnitRuntime>,
    timeouts: Timeouts,
    units: BTreeMap<UnitId, UnitRecord>,
}

impl WorkloadExecutor {
    /// Jobs and the service share `runtime`.
    pub fn new(runtime: Arc<dyn UnitRuntime>, timeouts: Timeouts) -> Self {
        Self {
            service: Arc::clone(&runtime),
            jobs: runtime,
            timeouts,
            units: BTreeMap::new(),
        }
    }

    /// Control the service through a different runtime than the jobs.
    pub fn with_service_runtime(mut self, runtime: Arc<dyn UnitRuntime>) -> Self {
        self.service = runtime;
        self
    }

    fn runtime_for(&self, unit: &UnitId) -> Arc<dyn UnitRuntime> {
        match unit {
            UnitId::Service => Arc::clone(&self.service),
            UnitId::Job(_) => Arc::clone(&self.jobs),
        }
    }

    fn record_mut(&mut self, unit: &UnitId) -> ExecutorResult<&mut UnitRecord> {
        self.units
            .get_mut(unit)
            .ok_or_else(|| ExecutorError::UnknownUnit(unit.clone()))
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Launch a unit pinned to exactly `spec.cores`. A unit that is already
    /// live is returned as is.
    pub async fn start(&mut self, spec: LaunchSpec) -> ExecutorResult<UnitHandle> {
        if let Some(record) = self.units.get(&spec.unit)
            && record.exited.is_none()
        {
            return Ok(UnitHandle {
                unit: spec.unit.clone(),
                pid: record.pid,
            });
        }

        let rt = self.runtime_for(&spec.unit);
        match bounded(&spec.unit, "launch", self.timeouts.launch, rt.launch(&spec)).await {
            Ok(()) => {}
            Err(e @ ExecutorError::Launch { .. }) => return Err(e),
            Err(e) => {
                // Whatever half-exists must not linger.
                let release = rt.release(&spec.unit);
                if let Err(cleanup) = bounded(&spec.unit, "release", self.timeouts.call, release).await {
                    warn!(unit = %spec.unit, error = %cleanup, "release after failed launch failed");
                }
                return Err(ExecutorError::Launch {
                    unit: spec.unit.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let pid = tokio::time::timeout(self.timeouts.call, rt.pid(&spec.unit))
            .await
            .ok()
            .flatten();
        info!(unit = %spec.unit, cores = %spec.cores, pid = ?pid, runtime = rt.name(), "unit started");
        self.units.insert(
            spec.unit.clone(),
            UnitRecord {
                cores: spec.cores,
                pid,
                paused: false,
                unresponsive: false,
                exited: None,
            },
        );
        Ok(UnitHandle {
            unit: spec.unit,
            pid,
        })
    }

    /// Adopt the already-running service process and pin it to `cores`.
    pub async fn attach_service(&mut self, pid: u32, cores: &CoreSet) -> ExecutorResult<UnitHandle> {
        let unit = UnitId::Service;
        let rt = self.runtime_for(&unit);
        bounded(&unit, "attach", self.timeouts.call, rt.attach(&unit, pid)).await?;
        bounded(&unit, "set_affinity", self.timeouts.call, rt.set_affinity(&unit, cores)).await?;

        info!(pid, cores = %cores, "attached to service");
        self.units.insert(
            unit.clone(),
            UnitRecord {
                cores: cores.clone(),
                pid: Some(pid),
                paused: false,
                unresponsive: false,
                exited: None,
            },
        );
        Ok(UnitHandle {
            unit,
            pid: Some(pid),
        })
    }

    /// Change a live unit's affinity without restarting it.
    ///
    /// An unresponsive unit is not contacted. A call that times out marks the
    /// unit unresponsive until a later status probe succeeds.
    pub async fn reassign_cores(&mut self, unit: &UnitId, cores: &CoreSet) -> ExecutorResult<()> {
        let timeout = self.timeouts.call;
        let rt = self.runtime_for(unit);
        let record = self.record_mut(unit)?;
        if record.unresponsive {
            return Err(ExecutorError::Unresponsive(unit.clone()));
        }
        if &record.cores == cores {
            return Ok(());
        }

        match tokio::time::timeout(timeout, rt.set_affinity(unit, cores)).await {
            Ok(Ok(())) => {
                debug!(unit = %unit, from = %record.cores, to = %cores, "cores reassigned");
                record.cores = cores.clone();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(unit = %unit, timeout = ?timeout, "core reassignment timed out; unit marked unresponsive");
                record.unresponsive = true;
                Err(ExecutorError::ReassignTimeout {
                    unit: unit.clone(),
                    timeout,
                })
            }
        }
    }

    /// Suspend a unit. Pausing a paused unit does nothing.
    pub async fn pause(&mut self, unit: &UnitId) -> ExecutorResult<()> {
        self.set_paused(unit, true).await
    }

    /// Continue a paused unit. Resuming a running unit does nothing.
    pub async fn resume(&mut self, unit: &UnitId) -> ExecutorResult<()> {
        self.set_paused(unit, false).await
    }

    async fn set_paused(&mut self, unit: &UnitId, paused: bool) -> ExecutorResult<()> {
        let timeout = self.timeouts.call;
        let rt = self.runtime_for(unit);
        let record = self.record_mut(unit)?;
        if record.paused == paused || record.exited.is_some() {
            return Ok(());
        }
        if record.unresponsive {
            return Err(ExecutorError::Unresponsive(unit.clone()));
        }

        let (op, call) = if paused {
            ("pause", rt.pause(unit))
        } else {
            ("resume", rt.resume(unit))
        };
        match bounded(unit, op, timeout, call).await {
            Ok(()) => {
                record.paused = paused;
                debug!(unit = %unit, op, "unit {op}d");
                Ok(())
            }
            Err(e @ ExecutorError::Timeout { .. }) => {
                record.unresponsive = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Point-in-time liveness. A probe that times out reports
    /// [`UnitStatus::Unresponsive`]; one that answers clears that mark.
    pub async fn status(&mut self, unit: &UnitId) -> ExecutorResult<UnitStatus> {
        let timeout = self.timeouts.call;
        let rt = self.runtime_for(unit);
        let record = self.record_mut(unit)?;
        if let Some(code) = record.exited {
            return Ok(UnitStatus::Exited(code));
        }

        match tokio::time::timeout(timeout, rt.status(unit)).await {
            Ok(Ok(status)) => {
                if record.unresponsive {
                    info!(unit = %unit, "unit responsive again");
                    record.unresponsive = false;
                }
                if let UnitStatus::Exited(code) = status {
                    record.exited = Some(code);
                }
                Ok(status)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if !record.unresponsive {
                    warn!(unit = %unit, timeout = ?timeout, "status probe timed out");
                }
                record.unresponsive = true;
                Ok(UnitStatus::Unresponsive)
            }
        }
    }

    /// Stop one unit: cooperative stop, then kill after `grace`.
    pub async fn stop(&mut self, unit: &UnitId, grace: Duration) -> ExecutorResult<StopOutcome> {
        if !self.units.contains_key(unit) {
            return Err(ExecutorError::UnknownUnit(unit.clone()));
        }
        let report = self.stop_units(vec![unit.clone()], grace).await;
        Ok(report
            .outcomes
            .get(unit)
            .copied()
            .unwrap_or(StopOutcome::Forced))
    }

    /// Stop every job unit. The service is never stopped.
    pub async fn stop_all(&mut self, grace: Duration) -> StopReport {
        let jobs: Vec<UnitId> = self
            .units
            .keys()
            .filter(|u| matches!(u, UnitId::Job(_)))
            .cloned()
            .collect();
        self.stop_units(jobs, grace).await
    }

    /// Signal all `units`, wait for them together, kill whatever is left at
    /// the deadline, then forget them. Every unit passed in is gone from the
    /// executor afterwards.
    async fn stop_units(&mut self, units: Vec<UnitId>, grace: Duration) -> StopReport {
        let call = self.timeouts.call;
        let deadline = Instant::now() + grace;
        let mut report = StopReport::default();
        let mut waiting = Vec::new();

        for unit in units {
            let Some(record) = self.units.get(&unit).cloned() else {
                continue;
            };
            if let Some(code) = record.exited {
                report.outcomes.insert(unit, StopOutcome::Graceful(code));
                continue;
            }
            let rt = self.runtime_for(&unit);
            // A frozen unit cannot take the stop signal; continue it first.
            if record.paused {
                match bounded(&unit, "resume", call, rt.resume(&unit)).await {
                    Ok(()) => {
                        if let Some(r) = self.units.get_mut(&unit) {
                            r.paused = false;
                        }
                    }
                    Err(e) => warn!(unit = %unit, error = %e, "resume before stop failed"),
                }
            }
            if let Err(e) = bounded(&unit, "stop", call, rt.signal_stop(&unit)).await {
                warn!(unit = %unit, error = %e, "cooperative stop failed");
            }
            waiting.push(unit);
        }

        loop {
            let mut still_running = Vec::new();
            for unit in waiting {
                match self.status(&unit).await {
                    Ok(UnitStatus::Exited(code)) => {
                        debug!(unit = %unit, code, "unit exited");
                        report.outcomes.insert(unit, StopOutcome::Graceful(code));
                    }
                    _ => still_running.push(unit),
                }
            }
            waiting = still_running;

            let now = Instant::now();
            if waiting.is_empty() || now >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }

        for unit in waiting {
            let rt = self.runtime_for(&unit);
            if let Err(e) = bounded(&unit, "kill", call, rt.kill(&unit)).await {
                warn!(unit = %unit, error = %e, "kill failed");
            }
            warn!(unit = %unit, grace = ?grace, "unit did not exit within its grace period; killed");
            report.outcomes.insert(unit, StopOutcome::Forced);
        }

        for unit in report.outcomes.keys() {
            self.forget(unit).await;
        }
        report
    }

    /// Drop an exited unit and whatever the runtime holds for it.
    pub async fn release(&mut self, unit: &UnitId) {
        self.forget(unit).await;
    }

    async fn forget(&mut self, unit: &UnitId) {
        let rt = self.runtime_for(unit);
        if let Err(e) = bounded(unit, "release", self.timeouts.call, rt.release(unit)).await {
            warn!(unit = %unit, error = %e, "runtime release failed");
        }
        self.units.remove(unit);
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn contains(&self, unit: &UnitId) -> bool {
        self.units.contains_key(unit)
    }

    /// Cores the unit is currently pinned to.
    pub fn cores(&self, unit: &UnitId) -> Option<&CoreSet> {
        self.units.get(unit).map(|r| &r.cores)
    }

    pub fn is_paused(&self, unit: &UnitId) -> bool {
        self.units.get(unit).is_some_and(|r| r.paused)
    }

    pub fn is_unresponsive(&self, unit: &UnitId) -> bool {
        self.units.get(unit).is_some_and(|r| r.unresponsive)
    }

    pub fn pid(&self, unit: &UnitId) -> Option<u32> {
        self.units.get(unit).and_then(|r| r.pid)
    }

    /// Pids of every tracked unit that has not exited.
    pub fn live_pids(&self) -> Vec<u32> {
        self.units
            .values()
            .filter(|r| r.exited.is_none())
            .filter_map(|r| r.pid)
            .collect()
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }
}

async fn bounded<T>(
    unit: &UnitId,
    op: &'static str,
    timeout: Duration,
    call: impl Future<Output = ExecutorResult<T>>,
) -> ExecutorResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ExecutorError::Timeout {
            unit: unit.clone(),
            op,
            timeout,
        }),
    }
}
