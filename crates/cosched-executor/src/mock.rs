//! Scriptable in-memory runtime for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use cosched_core::{CoreSet, UnitId, UnitStatus};

use crate::error::{ExecutorError, ExecutorResult};
use crate::runtime::{LaunchSpec, UnitRuntime};

/// Exit code a mock unit reports after a cooperative stop.
pub const MOCK_TERM_EXIT: i32 = 143;
/// Exit code a mock unit reports after being killed.
pub const MOCK_KILL_EXIT: i32 = 137;

/// One call the runtime received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Launch { unit: UnitId, cores: CoreSet },
    Attach { unit: UnitId, pid: u32 },
    SetAffinity { unit: UnitId, cores: CoreSet },
    Pause(UnitId),
    Resume(UnitId),
    SignalStop(UnitId),
    Kill(UnitId),
    Release(UnitId),
}

#[derive(Debug, Clone)]
struct MockUnit {
    pid: u32,
    cores: CoreSet,
    paused: bool,
    exit: Option<i32>,
}

#[derive(Debug, Default)]
struct MockState {
    units: HashMap<UnitId, MockUnit>,
    calls: Vec<MockCall>,
    fail_launch: HashSet<UnitId>,
    hang_affinity: HashSet<UnitId>,
    hang_status: HashSet<UnitId>,
    ignore_stop: HashSet<UnitId>,
    next_pid: u32,
}

/// A runtime whose units are plain records. Tests script exits, launch
/// failures and hangs, then inspect the call log.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the original failure.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next launches of `unit` fail.
    pub fn fail_launch(&self, unit: UnitId) {
        self.lock().fail_launch.insert(unit);
    }

    /// Make affinity updates of `unit` never return.
    pub fn hang_affinity(&self, unit: UnitId) {
        self.lock().hang_affinity.insert(unit);
    }

    /// Make status probes of `unit` never return.
    pub fn hang_status(&self, unit: UnitId) {
        self.lock().hang_status.insert(unit);
    }

    /// Undo every hang registered for `unit`.
    pub fn unhang(&self, unit: &UnitId) {
        let mut state = self.lock();
        state.hang_affinity.remove(unit);
        state.hang_status.remove(unit);
    }

    /// Make `unit` ignore cooperative stops.
    pub fn ignore_stop(&self, unit: UnitId) {
        self.lock().ignore_stop.insert(unit);
    }

    /// The unit exits with `code`.
    pub fn finish(&self, unit: &UnitId, code: i32) {
        if let Some(u) = self.lock().units.get_mut(unit) {
            u.exit = Some(code);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Current affinity of a unit the runtime knows about.
    pub fn cores_of(&self, unit: &UnitId) -> Option<CoreSet> {
        self.lock().units.get(unit).map(|u| u.cores.clone())
    }

    pub fn is_paused(&self, unit: &UnitId) -> bool {
        self.lock().units.get(unit).is_some_and(|u| u.paused)
    }

    /// Known and not exited.
    pub fn is_live(&self, unit: &UnitId) -> bool {
        self.lock().units.get(unit).is_some_and(|u| u.exit.is_none())
    }

    fn with_unit<T>(
        &self,
        unit: &UnitId,
        call: MockCall,
        f: impl FnOnce(&mut MockUnit) -> T,
    ) -> ExecutorResult<T> {
        let mut state = self.lock();
        state.calls.push(call);
        state
            .units
            .get_mut(unit)
            .map(f)
            .ok_or_else(|| ExecutorError::UnknownUnit(unit.clone()))
    }
}

#[async_trait]
impl UnitRuntime for MockRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ExecutorResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Launch {
            unit: spec.unit.clone(),
            cores: spec.cores.clone(),
        });
        if state.fail_launch.contains(&spec.unit) {
            return Err(ExecutorError::Launch {
                unit: spec.unit.clone(),
                reason: "image not found".to_string(),
            });
        }
        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;
        state.units.insert(
            spec.unit.clone(),
            MockUnit {
                pid,
                cores: spec.cores.clone(),
                paused: false,
                exit: None,
            },
        );
        Ok(())
    }

    async fn attach(&self, unit: &UnitId, pid: u32) -> ExecutorResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Attach {
            unit: unit.clone(),
            pid,
        });
        state.units.insert(
            unit.clone(),
            MockUnit {
                pid,
                cores: CoreSet::new(),
                paused: false,
                exit: None,
            },
        );
        Ok(())
    }

    async fn set_affinity(&self, unit: &UnitId, cores: &CoreSet) -> ExecutorResult<()> {
        let hang = self.lock().hang_affinity.contains(unit);
        if hang {
            std::future::pending::<()>().await;
        }
        let call = MockCall::SetAffinity {
            unit: unit.clone(),
            cores: cores.clone(),
        };
        self.with_unit(unit, call, |u| u.cores = cores.clone())
    }

    async fn pause(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.with_unit(unit, MockCall::Pause(unit.clone()), |u| u.paused = true)
    }

    async fn resume(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.with_unit(unit, MockCall::Resume(unit.clone()), |u| u.paused = false)
    }

    /// Paused units reject the signal, as `docker kill` does.
    async fn signal_stop(&self, unit: &UnitId) -> ExecutorResult<()> {
        let ignore = self.lock().ignore_stop.contains(unit);
        let paused = self.with_unit(unit, MockCall::SignalStop(unit.clone()), |u| {
            if u.paused {
                return true;
            }
            if !ignore && u.exit.is_none() {
                u.exit = Some(MOCK_TERM_EXIT);
            }
            false
        })?;
        if paused {
            return Err(ExecutorError::runtime(unit, "signal_stop", "unit is paused"));
        }
        Ok(())
    }

    async fn kill(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.with_unit(unit, MockCall::Kill(unit.clone()), |u| {
            if u.exit.is_none() {
                u.exit = Some(MOCK_KILL_EXIT);
            }
        })
    }

    async fn status(&self, unit: &UnitId) -> ExecutorResult<UnitStatus> {
        let hang = self.lock().hang_status.contains(unit);
        if hang {
            std::future::pending::<()>().await;
        }
        let state = self.lock();
        let u = state
            .units
            .get(unit)
            .ok_or_else(|| ExecutorError::UnknownUnit(unit.clone()))?;
        Ok(match (u.exit, u.paused) {
            (Some(code), _) => UnitStatus::Exited(code),
            (None, true) => UnitStatus::Paused,
            (None, false) => UnitStatus::Running,
        })
    }

    async fn pid(&self, unit: &UnitId) -> Option<u32> {
        self.lock().units.get(unit).map(|u| u.pid)
    }

    async fn release(&self, unit: &UnitId) -> ExecutorResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Release(unit.clone()));
        state.units.remove(unit);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
