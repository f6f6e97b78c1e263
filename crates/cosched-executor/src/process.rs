//! Raw process control.
//!
//! Each job runs in its own process group so pause/stop reach every
//! process it forks. A new mask is applied to every thread of every process
//! in the group, since job commands are usually wrappers that fork the real
//! worker. The first exec is pinned before it runs.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use cosched_core::{CoreSet, UnitId, UnitStatus};

use crate::error::{ExecutorError, ExecutorResult};
use crate::runtime::{LaunchSpec, UnitRuntime};

/// Exit code reported for an adopted process that vanished.
const UNKNOWN_EXIT: i32 = -1;
/// Group walks per affinity update; a later walk catches processes forked
/// during the previous one.
const PIN_PASSES: usize = 4;

#[derive(Debug)]
struct ProcEntry {
    pid: u32,
    /// `None` for adopted processes.
    child: Option<Child>,
    exit: Option<i32>,
    /// Signals go to the whole group when we created it.
    own_group: bool,
}

#[derive(Debug)]
pub struct ProcessRuntime {
    proc_root: PathBuf,
    units: Mutex<HashMap<UnitId, ProcEntry>>,
}

impl ProcessRuntime {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            units: Mutex::new(HashMap::new()),
        }
    }

    async fn with_entry<T>(
        &self,
        unit: &UnitId,
        f: impl FnOnce(&mut ProcEntry) -> ExecutorResult<T>,
    ) -> ExecutorResult<T> {
        let mut units = self.units.lock().await;
        let entry = units
            .get_mut(unit)
            .ok_or_else(|| ExecutorError::UnknownUnit(unit.clone()))?;
        f(entry)
    }

    async fn signal(&self, unit: &UnitId, op: &'static str, sig: libc::c_int) -> ExecutorResult<()> {
        self.with_entry(unit, |entry| {
            if entry.exit.is_some() {
                return Ok(());
            }
            send_signal(entry, sig).map_err(|e| ExecutorError::runtime(unit, op, e))
        })
        .await
    }
}

#[async_trait]
impl UnitRuntime for ProcessRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ExecutorResult<()> {
        let launch_err = |reason: String| ExecutorError::Launch {
            unit: spec.unit.clone(),
            reason,
        };
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| launch_err("empty command".to_string()))?;
        if spec.cores.is_empty() {
            return Err(launch_err("no cores assigned".to_string()));
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);

        let set = cpu_set(&spec.cores);
        // SAFETY: the closure runs in the forked child before exec and only
        // calls sched_setaffinity, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err("process exited before it could be tracked".to_string()))?;

        debug!(unit = %spec.unit, pid, cores = %spec.cores, "process spawned");
        self.units.lock().await.insert(
            spec.unit.clone(),
            ProcEntry {
                pid,
                child: Some(child),
                exit: None,
                own_group: true,
            },
        );
        Ok(())
    }

    async fn attach(&self, unit: &UnitId, pid: u32) -> ExecutorResult<()> {
        if read_state(&self.proc_root, pid).is_none() {
            return Err(ExecutorError::runtime(unit, "attach", format!("no process {pid}")));
        }
        self.units.lock().await.insert(
            unit.clone(),
            ProcEntry {
                pid,
                child: None,
                exit: None,
                own_group: false,
            },
        );
        Ok(())
    }

    async fn set_affinity(&self, unit: &UnitId, cores: &CoreSet) -> ExecutorResult<()> {
        let (pid, own_group) = self
            .with_entry(unit, |entry| Ok((entry.pid, entry.own_group)))
            .await?;
        let pinned = if own_group {
            pin_group(&self.proc_root, pid, cores)
        } else {
            pin_threads(&self.proc_root, pid, &cpu_set(cores))
        };
        pinned.map_err(|e| ExecutorError::runtime(unit, "set_affinity", e))
    }

    async fn pause(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.signal(unit, "pause", libc::SIGSTOP).await
    }

    async fn resume(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.signal(unit, "resume", libc::SIGCONT).await
    }

    async fn signal_stop(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.signal(unit, "stop", libc::SIGTERM).await
    }

    async fn kill(&self, unit: &UnitId) -> ExecutorResult<()> {
        self.signal(unit, "kill", libc::SIGKILL).await
    }

    async fn status(&self, unit: &UnitId) -> ExecutorResult<UnitStatus> {
        let proc_root = self.proc_root.clone();
        self.with_entry(unit, |entry| {
            if let Some(code) = entry.exit {
                return Ok(UnitStatus::Exited(code));
            }
            if let Some(child) = entry.child.as_mut()
                && let Some(status) = child
                    .try_wait()
                    .map_err(|e| ExecutorError::runtime(unit, "status", e))?
            {
                let code = exit_code(status);
                entry.exit = Some(code);
                return Ok(UnitStatus::Exited(code));
            }
            match read_state(&proc_root, entry.pid) {
                Some('T') | Some('t') => Ok(UnitStatus::Paused),
                Some('Z') | Some('X') | None if entry.child.is_none() => {
                    entry.exit = Some(UNKNOWN_EXIT);
                    Ok(UnitStatus::Exited(UNKNOWN_EXIT))
                }
                _ => Ok(UnitStatus::Running),
            }
        })
        .await
    }

    async fn pid(&self, unit: &UnitId) -> Option<u32> {
        self.units.lock().await.get(unit).map(|e| e.pid)
    }

    async fn release(&self, unit: &UnitId) -> ExecutorResult<()> {
        let entry = self.units.lock().await.remove(unit);
        // A spawned child that is still running must not keep its cores busy.
        // Adopted processes are left alone.
        if let Some(mut entry) = entry
            && entry.exit.is_none()
            && entry.child.is_some()
        {
            if let Err(e) = send_signal(&entry, libc::SIGKILL) {
                warn!(unit = %unit, pid = entry.pid, error = %e, "kill on release failed");
            }
            if let Some(child) = entry.child.as_mut()
                && let Err(e) = child.try_wait()
            {
                warn!(unit = %unit, pid = entry.pid, error = %e, "reaping released process failed");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

// ── Internal helpers ────────────────────────────────────────────

fn send_signal(entry: &ProcEntry, sig: libc::c_int) -> io::Result<()> {
    let pid = entry.pid as libc::pid_t;
    // SAFETY: plain syscalls on a pid we track.
    let rc = unsafe {
        if entry.own_group {
            libc::killpg(pid, sig)
        } else {
            libc::kill(pid, sig)
        }
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone; status will report the exit.
        Ok(())
    } else {
        Err(err)
    }
}

fn cpu_set(cores: &CoreSet) -> libc::cpu_set_t {
    // SAFETY: cpu_set_t is a plain bitmask; all zeroes is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for core in cores.iter() {
        unsafe { libc::CPU_SET(core as usize, &mut set) };
    }
    set
}

/// Pin every process in group `pgid` to `cores`.
fn pin_group(proc_root: &Path, pgid: u32, cores: &CoreSet) -> io::Result<()> {
    let set = cpu_set(cores);
    let mut pinned = HashSet::new();
    for _ in 0..PIN_PASSES {
        let fresh: Vec<u32> = group_members(proc_root, pgid)?
            .into_iter()
            .filter(|pid| !pinned.contains(pid))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for pid in fresh {
            match pin_threads(proc_root, pid, &set) {
                // Exited between listing and pinning.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
            pinned.insert(pid);
        }
    }
    debug!(pgid, processes = pinned.len(), cores = %cores, "group pinned");
    Ok(())
}

/// Pids whose process group is `pgid`, the leader included.
fn group_members(proc_root: &Path, pgid: u32) -> io::Result<Vec<u32>> {
    let mut members = Vec::new();
    for entry in std::fs::read_dir(proc_root)?.filter_map(Result::ok) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if read_stat(proc_root, pid).is_some_and(|stat| stat.pgrp == pgid) {
            members.push(pid);
        }
    }
    members.sort_unstable();
    Ok(members)
}

/// Pin every thread of `pid` to `set`.
fn pin_threads(proc_root: &Path, pid: u32, set: &libc::cpu_set_t) -> io::Result<()> {
    let tasks = std::fs::read_dir(proc_root.join(pid.to_string()).join("task"))?;
    for task in tasks.filter_map(Result::ok) {
        let Some(tid) = task.file_name().to_str().and_then(|s| s.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        // SAFETY: `set` outlives the call and the size matches its type.
        let rc = unsafe {
            libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), set)
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Threads may exit between listing and pinning.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// The fields of `/proc/<pid>/stat` this runtime needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    pgrp: u32,
}

fn read_stat(proc_root: &Path, pid: u32) -> Option<ProcStat> {
    let content = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    // The command name may contain spaces and parentheses.
    let (_, rest) = content.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { state, pgrp })
}

/// Single-letter state from `/proc/<pid>/stat`.
fn read_state(proc_root: &Path, pid: u32) -> Option<char> {
    read_stat(proc_root, pid).map(|stat| stat.state)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
