//! The per-tick sampling seam.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use cosched_core::epoch_millis;

use crate::error::{TelemetryError, TelemetryResult};
use crate::procfs::{HostReader, HostReading};
use crate::sample::TelemetrySample;
use crate::stats::StatsReader;

/// Anything that can produce one [`TelemetrySample`] per control tick.
///
/// `pids` are the processes whose usage should be reported (the service and
/// every live job). An `Err` means the whole sample was lost; an unreachable
/// service alone is not an error and shows up as
/// [`ServiceStats::Unavailable`](crate::ServiceStats::Unavailable).
#[async_trait]
pub trait TelemetrySource: Send {
    async fn sample(&mut self, pids: &[u32]) -> TelemetryResult<TelemetrySample>;
}

/// Production source: procfs plus the service's stats endpoint.
pub struct SystemSampler {
    host: Arc<Mutex<HostReader>>,
    stats: StatsReader,
    budget: Duration,
}

impl SystemSampler {
    pub fn new(
        proc_root: impl Into<PathBuf>,
        stats_addr: impl Into<String>,
        stats_timeout: Duration,
        latency_stat: impl Into<String>,
        budget: Duration,
    ) -> Self {
        Self {
            host: Arc::new(Mutex::new(HostReader::new(proc_root))),
            stats: StatsReader::new(stats_addr, stats_timeout, latency_stat),
            budget,
        }
    }

    pub fn from_config(config: &cosched_core::CoschedConfig) -> Self {
        Self::new(
            config.telemetry.proc_root.clone(),
            config.service.stats_addr.clone(),
            config.telemetry.stats_timeout,
            config.service.slo.latency_stat.clone(),
            config.telemetry.sample_budget,
        )
    }
}

async fn read_host(host: Arc<Mutex<HostReader>>, pids: Vec<u32>) -> TelemetryResult<HostReading> {
    tokio::task::spawn_blocking(move || {
        let mut reader = host
            .lock()
            .map_err(|_| TelemetryError::Task("host reader lock poisoned".to_string()))?;
        reader.read(&pids)
    })
    .await
    .map_err(|e| TelemetryError::Task(e.to_string()))?
}

#[async_trait]
impl TelemetrySource for SystemSampler {
    async fn sample(&mut self, pids: &[u32]) -> TelemetryResult<TelemetrySample> {
        let taken_at = epoch_millis();
        let budget = self.budget;
        let pids = pids.to_vec();

        let host = read_host(Arc::clone(&self.host), pids);
        let work = async { tokio::join!(host, self.stats.read()) };

        let (host, service) = match tokio::time::timeout(budget, work).await {
            Ok(pair) => pair,
            Err(_) => {
                warn!(budget = ?budget, "telemetry sample exceeded its budget");
                return Err(TelemetryError::BudgetExceeded(budget));
            }
        };
        let host = host?;

        Ok(TelemetrySample {
            taken_at,
            core_utilization: host.core_utilization,
            processes: host.processes,
            memory: host.memory,
            service,
        })
    }
}
