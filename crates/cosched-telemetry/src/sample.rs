//! Telemetry sample types.

use std::collections::BTreeMap;

use serde::Serialize;

use cosched_core::{CoreId, CoreSet, Timestamp};

/// CPU and memory use of one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessUsage {
    /// Percent of one core (can exceed 100 for multi-threaded processes).
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub threads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.total_bytes - self.available_bytes.min(self.total_bytes)) as f64 * 100.0
            / self.total_bytes as f64
    }
}

/// A parsed stats reply from the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReading {
    /// Value of the configured latency stat, in microseconds.
    pub latency_us: Option<f64>,
    /// Operations per second since the previous reading.
    pub qps: Option<f64>,
    /// Cumulative get + set count.
    pub total_ops: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceStats {
    Available(ServiceReading),
    Unavailable { reason: String },
}

impl ServiceStats {
    pub fn reading(&self) -> Option<&ServiceReading> {
        match self {
            ServiceStats::Available(r) => Some(r),
            ServiceStats::Unavailable { .. } => None,
        }
    }
}

/// One observation of the host and the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub taken_at: Timestamp,
    /// Busy percent per core since the previous sample.
    pub core_utilization: BTreeMap<CoreId, f64>,
    /// Keyed by pid.
    pub processes: BTreeMap<u32, ProcessUsage>,
    pub memory: Option<MemoryUsage>,
    pub service: ServiceStats,
}

impl TelemetrySample {
    /// An empty sample carrying only the reason the service is unreadable.
    pub fn unavailable(taken_at: Timestamp, reason: impl Into<String>) -> Self {
        Self {
            taken_at,
            core_utilization: BTreeMap::new(),
            processes: BTreeMap::new(),
            memory: None,
            service: ServiceStats::Unavailable {
                reason: reason.into(),
            },
        }
    }

    pub fn service_stats_unavailable(&self) -> bool {
        matches!(self.service, ServiceStats::Unavailable { .. })
    }

    /// Mean utilization over `cores`; `None` if none of them were measured.
    pub fn utilization_of(&self, cores: &CoreSet) -> Option<f64> {
        let readings: Vec<f64> = cores
            .iter()
            .filter_map(|c| self.core_utilization.get(&c).copied())
            .collect();
        if readings.is_empty() {
            None
        } else {
            Some(readings.iter().sum::<f64>() / readings.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_of_averages_measured_cores() {
        let mut sample = TelemetrySample::unavailable(0, "test");
        sample.core_utilization.insert(0, 90.0);
        sample.core_utilization.insert(1, 50.0);

        assert_eq!(sample.utilization_of(&CoreSet::from([0, 1])), Some(70.0));
        assert_eq!(sample.utilization_of(&CoreSet::from([0, 7])), Some(90.0));
        assert_eq!(sample.utilization_of(&CoreSet::from([7])), None);
    }

    #[test]
    fn memory_used_percent() {
        let mem = MemoryUsage {
            total_bytes: 1000,
            available_bytes: 250,
        };
        assert_eq!(mem.used_percent(), 75.0);
    }

    #[test]
    fn service_stats_serialize_tagged() {
        let stats = ServiceStats::Unavailable {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"state":"unavailable","reason":"timeout"}"#);
    }
}
