//! Host resource usage from procfs.
//!
//! Utilization figures are deltas between consecutive reads, so the reader
//! keeps the previous counters. The first read of a core or process is
//! measured since boot (or since the process started).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use cosched_core::{CoreId, CoreSet};

use crate::error::{TelemetryError, TelemetryResult};
use crate::sample::{MemoryUsage, ProcessUsage};

/// Jiffy counters for one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Fields of `/proc/<pid>/stat` the sampler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidStat {
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    pub threads: u32,
    pub rss_pages: u64,
}

/// Host-side half of a telemetry sample.
#[derive(Debug, Clone, Default)]
pub struct HostReading {
    pub core_utilization: BTreeMap<CoreId, f64>,
    pub processes: BTreeMap<u32, ProcessUsage>,
    pub memory: Option<MemoryUsage>,
}

/// Parse the per-core `cpuN` lines of `/proc/stat`.
pub fn parse_proc_stat(content: &str) -> TelemetryResult<BTreeMap<CoreId, CpuTimes>> {
    let mut cores = BTreeMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let Some(id) = label.strip_prefix("cpu").filter(|s| !s.is_empty()) else {
            continue;
        };
        let id: CoreId = id.parse().map_err(|_| malformed("/proc/stat", line))?;

        let values: Vec<u64> = fields
            .map(str::parse::<u64>)
            .collect::<Result<_, _>>()
            .map_err(|_| malformed("/proc/stat", line))?;
        if values.len() < 4 {
            return Err(malformed("/proc/stat", line));
        }

        // user nice system idle iowait irq softirq steal [guest guest_nice]
        // guest time is already counted in user/nice.
        let total: u64 = values.iter().take(8).sum();
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        cores.insert(
            id,
            CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            },
        );
    }
    Ok(cores)
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_pid_stat(content: &str) -> TelemetryResult<PidStat> {
    let rest = content
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| malformed("pid stat", content))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is field 3 (state) of proc(5).
    let field = |n: usize| -> TelemetryResult<u64> {
        fields
            .get(n - 3)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed("pid stat", content))
    };

    Ok(PidStat {
        cpu_ticks: field(14)? + field(15)?,
        threads: field(20)? as u32,
        rss_pages: field(24)?,
    })
}

/// Parse `MemTotal` and `MemAvailable` from `/proc/meminfo`.
pub fn parse_meminfo(content: &str) -> TelemetryResult<MemoryUsage> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let kb = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (key, kb) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb * 1024),
            (Some("MemAvailable:"), Some(kb)) => available = Some(kb * 1024),
            _ => {}
        }
    }
    match (total, available) {
        (Some(total_bytes), Some(available_bytes)) => Ok(MemoryUsage {
            total_bytes,
            available_bytes,
        }),
        _ => Err(malformed("/proc/meminfo", "missing MemTotal or MemAvailable")),
    }
}

/// Busy percent per core between two `/proc/stat` reads.
pub fn utilization_between(
    prev: &BTreeMap<CoreId, CpuTimes>,
    curr: &BTreeMap<CoreId, CpuTimes>,
) -> BTreeMap<CoreId, f64> {
    curr.iter()
        .map(|(&core, now)| {
            let before = prev.get(&core).copied().unwrap_or_default();
            let total = now.total.saturating_sub(before.total);
            let busy = now.busy.saturating_sub(before.busy);
            let pct = if total == 0 {
                0.0
            } else {
                busy as f64 * 100.0 / total as f64
            };
            (core, pct)
        })
        .collect()
}

/// Stateful procfs reader.
#[derive(Debug)]
pub struct HostReader {
    proc_root: PathBuf,
    clock_ticks: f64,
    page_size: u64,
    prev_cpu: BTreeMap<CoreId, CpuTimes>,
    prev_proc: HashMap<u32, (u64, Instant)>,
}

impl HostReader {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            clock_ticks: clock_ticks_per_sec(),
            page_size: page_size(),
            prev_cpu: BTreeMap::new(),
            prev_proc: HashMap::new(),
        }
    }

    /// Read host counters and usage of `pids`. Pids that have vanished are
    /// left out of the result.
    pub fn read(&mut self, pids: &[u32]) -> TelemetryResult<HostReading> {
        let stat = read_file(&self.proc_root.join("stat"))?;
        let cpu = parse_proc_stat(&stat)?;
        let core_utilization = utilization_between(&self.prev_cpu, &cpu);
        self.prev_cpu = cpu;

        let memory = match read_file(&self.proc_root.join("meminfo")) {
            Ok(content) => parse_meminfo(&content).ok(),
            Err(_) => None,
        };

        let now = Instant::now();
        let mut processes = BTreeMap::new();
        let mut seen = HashMap::with_capacity(pids.len());
        for &pid in pids {
            let path = self.proc_root.join(pid.to_string()).join("stat");
            let pid_stat = match read_file(&path).and_then(|c| parse_pid_stat(&c)) {
                Ok(s) => s,
                Err(e) => {
                    debug!(pid, error = %e, "process stat unreadable");
                    continue;
                }
            };

            let cpu_percent = match self.prev_proc.get(&pid) {
                Some(&(ticks, at)) => {
                    let elapsed = now.duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        pid_stat.cpu_ticks.saturating_sub(ticks) as f64 / self.clock_ticks
                            / elapsed
                            * 100.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            seen.insert(pid, (pid_stat.cpu_ticks, now));
            processes.insert(
                pid,
                ProcessUsage {
                    cpu_percent,
                    rss_bytes: pid_stat.rss_pages * self.page_size,
                    threads: pid_stat.threads,
                },
            );
        }
        self.prev_proc = seen;

        Ok(HostReading {
            core_utilization,
            processes,
            memory,
        })
    }
}

/// First pid whose `comm` equals `name`, lowest pid first.
pub fn find_pid_by_name(proc_root: &Path, name: &str) -> TelemetryResult<Option<u32>> {
    let entries = std::fs::read_dir(proc_root).map_err(|source| TelemetryError::Io {
        path: proc_root.to_path_buf(),
        source,
    })?;

    let mut pids: Vec<u32> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    pids.sort_unstable();

    for pid in pids {
        let comm = proc_root.join(pid.to_string()).join("comm");
        if let Ok(content) = std::fs::read_to_string(&comm)
            && content.trim_end() == name
        {
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

/// Online cores from sysfs, falling back to `0..available_parallelism`.
pub fn online_cores(sys_root: &Path) -> CoreSet {
    let path = sys_root.join("devices/system/cpu/online");
    if let Ok(content) = std::fs::read_to_string(&path)
        && let Ok(set) = content.trim().parse::<CoreSet>()
        && !set.is_empty()
    {
        return set;
    }
    let n = std::thread::available_parallelism()
        .map(|n| n.get() as CoreId)
        .unwrap_or(1);
    CoreSet::range(0, n - 1)
}

fn read_file(path: &Path) -> TelemetryResult<String> {
    std::fs::read_to_string(path).map_err(|source| TelemetryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn malformed(what: &'static str, detail: &str) -> TelemetryError {
    TelemetryError::Malformed {
        what,
        detail: detail.chars().take(120).collect(),
    }
}

fn clock_ticks_per_sec() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}
