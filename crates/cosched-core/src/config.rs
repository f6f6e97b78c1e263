//! cosched.toml configuration parser.
//!
//! Only `[service]` (how to find the service and its stats endpoint) is
//! required; every other section falls back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cpuset::CoreSet;
use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::jobs::{HostContext, JobSet, JobSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoschedConfig {
    #[serde(default)]
    pub host: HostConfig,
    pub service: ServiceConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Optional separate jobs file; its jobs are appended to `jobs`.
    #[serde(default)]
    pub jobs_file: Option<PathBuf>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Core inventory; every online core when unset.
    pub cores: Option<CoreSet>,
    /// This host's node class, matched against jobs' `node_class`.
    pub node_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Process name to attach to (first match).
    #[serde(default)]
    pub process_name: Option<String>,
    /// Explicit pid; wins over `process_name`.
    #[serde(default)]
    pub pid: Option<u32>,
    /// host:port of the stats endpoint.
    pub stats_addr: String,
    /// Cores reserved at startup; the lowest `min_cores` cores when unset.
    #[serde(default)]
    pub initial_cores: Option<CoreSet>,
    #[serde(default = "default_min_cores")]
    pub min_cores: usize,
    /// Upper bound on the reserved set; the whole inventory when unset.
    #[serde(default)]
    pub max_cores: Option<usize>,
    #[serde(default)]
    pub slo: SloConfig,
}

fn default_min_cores() -> usize {
    1
}

/// Which signal decides whether the service is in breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloMetric {
    /// Tail latency from the stats endpoint.
    Latency,
    /// CPU utilization of the service's reserved cores.
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SloConfig {
    pub metric: SloMetric,
    pub percentile: u8,
    pub threshold_us: f64,
    /// Latency below `threshold_us * comfort_ratio` counts as comfortable.
    pub comfort_ratio: f64,
    /// Stats key carrying the latency reading, in microseconds.
    pub latency_stat: String,
    pub cpu_high_pct: f64,
    pub cpu_low_pct: f64,
    /// A reading older than this is treated as missing.
    #[serde(with = "serde_str")]
    pub stale_after: Duration,
    /// Number of samples kept in the rolling window.
    pub window: usize,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            metric: SloMetric::Latency,
            percentile: 95,
            threshold_us: 1000.0,
            comfort_ratio: 0.8,
            latency_stat: "latency_p95_us".to_string(),
            cpu_high_pct: 88.0,
            cpu_low_pct: 50.0,
            stale_after: Duration::from_secs(6),
            window: 32,
        }
    }
}

/// How to pick the first victim among jobs started at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Reverse name order loses first.
    Name,
    /// The job holding the most cores loses first.
    MostCores,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde(with = "serde_str")]
    pub tick_period: Duration,
    /// Consecutive comfortable ticks required before the service shrinks.
    pub hysteresis_ticks: u32,
    pub grow_step: usize,
    pub shrink_step: usize,
    /// Fewest cores a running job is reduced to before it is paused.
    pub job_floor_cores: usize,
    /// Pause the most recently started job once every job is at its floor.
    pub pause_on_exhaustion: bool,
    pub tie_break: TieBreak,
    /// Ticks a unit may stay unresponsive before its job is failed.
    pub unresponsive_ticks: u32,
    /// Log a warning when a tick starts this late.
    #[serde(with = "serde_str")]
    pub drift_warn: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(2),
            hysteresis_ticks: 3,
            grow_step: 1,
            shrink_step: 1,
            job_floor_cores: 1,
            pause_on_exhaustion: true,
            tie_break: TieBreak::Name,
            unresponsive_ticks: 3,
            drift_warn: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Process,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub runtime: RuntimeKind,
    /// Bound on every single runtime call.
    #[serde(with = "serde_str")]
    pub call_timeout: Duration,
    /// Bound on launching a unit, which may include pulling an image.
    #[serde(with = "serde_str")]
    pub launch_timeout: Duration,
    /// Cooperative stop window before a unit is force-killed.
    #[serde(with = "serde_str")]
    pub stop_grace: Duration,
    pub docker_bin: String,
    pub container_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Process,
            call_timeout: Duration::from_secs(2),
            launch_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            docker_bin: "docker".to_string(),
            container_prefix: "cosched".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(with = "serde_str")]
    pub stats_timeout: Duration,
    /// Whole-sample budget; an over-budget sample is abandoned.
    #[serde(with = "serde_str")]
    pub sample_budget: Duration,
    pub proc_root: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stats_timeout: Duration::from_millis(500),
            sample_budget: Duration::from_secs(1),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl std::str::FromStr for CoschedConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl CoschedConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CoschedConfig = content.parse()?;

        // A relative jobs file is relative to the config file.
        if let Some(jobs_file) = config.jobs_file.take() {
            let resolved = match path.parent() {
                Some(dir) if jobs_file.is_relative() => dir.join(jobs_file),
                _ => jobs_file,
            };
            config.jobs_file = Some(resolved);
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The core inventory: `[host] cores`, or `online` when unset.
    pub fn inventory(&self, online: &CoreSet) -> ConfigResult<CoreSet> {
        let inventory = self.host.cores.clone().unwrap_or_else(|| online.clone());
        if inventory.is_empty() {
            return Err(ConfigError::Invalid("core inventory is empty".to_string()));
        }
        Ok(inventory)
    }

    /// Cores the service holds at startup.
    pub fn initial_service_cores(&self, inventory: &CoreSet) -> CoreSet {
        match &self.service.initial_cores {
            Some(cores) => cores.clone(),
            None => inventory.lowest(self.service.min_cores),
        }
    }

    /// Largest reserved set the service may grow to.
    pub fn service_max_cores(&self, inventory: &CoreSet) -> usize {
        self.service.max_cores.unwrap_or(inventory.len()).min(inventory.len())
    }

    /// Validate the whole configuration and build the job set.
    ///
    /// `extra_jobs` come from a jobs file given on the command line or via
    /// `jobs_file`.
    pub fn validate(&self, inventory: &CoreSet, extra_jobs: Vec<JobSpec>) -> ConfigResult<JobSet> {
        let svc = &self.service;
        if svc.process_name.is_none() && svc.pid.is_none() {
            return Err(ConfigError::Invalid(
                "[service] needs either process_name or pid".to_string(),
            ));
        }
        if svc.stats_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("[service] stats_addr is empty".to_string()));
        }

        let max = self.service_max_cores(inventory);
        if svc.min_cores == 0 || svc.min_cores > max {
            return Err(ConfigError::Invalid(format!(
                "service min_cores {} must be between 1 and max_cores {max}",
                svc.min_cores
            )));
        }
        let initial = self.initial_service_cores(inventory);
        if !initial.is_subset(inventory) {
            return Err(ConfigError::Invalid(format!(
                "service initial_cores {initial} are outside the inventory {inventory}"
            )));
        }
        if initial.len() < svc.min_cores || initial.len() > max {
            return Err(ConfigError::Invalid(format!(
                "service initial_cores {initial} must hold between {} and {max} cores",
                svc.min_cores
            )));
        }

        let slo = &svc.slo;
        if !(slo.comfort_ratio > 0.0 && slo.comfort_ratio <= 1.0) {
            return Err(ConfigError::Invalid("slo comfort_ratio must be in (0, 1]".to_string()));
        }
        if slo.metric == SloMetric::Cpu && slo.cpu_low_pct >= slo.cpu_high_pct {
            return Err(ConfigError::Invalid(
                "slo cpu_low_pct must be below cpu_high_pct".to_string(),
            ));
        }
        if slo.window == 0 {
            return Err(ConfigError::Invalid("slo window must be at least 1".to_string()));
        }

        let ctl = &self.controller;
        if ctl.tick_period.is_zero() {
            return Err(ConfigError::Invalid("tick_period must be positive".to_string()));
        }
        if ctl.grow_step == 0 || ctl.shrink_step == 0 || ctl.job_floor_cores == 0 {
            return Err(ConfigError::Invalid(
                "grow_step, shrink_step and job_floor_cores must be at least 1".to_string(),
            ));
        }
        if self.telemetry.sample_budget >= ctl.tick_period {
            return Err(ConfigError::Invalid(
                "telemetry sample_budget must be shorter than tick_period".to_string(),
            ));
        }

        let mut jobs = self.jobs.clone();
        jobs.extend(extra_jobs);
        if jobs.is_empty() {
            return Err(ConfigError::Invalid("no jobs defined".to_string()));
        }

        JobSet::new(
            jobs,
            &HostContext {
                inventory,
                node_class: self.host.node_class.as_deref(),
                runtime: self.executor.runtime,
            },
        )
    }
}
