//! SLO tracking for the latency-critical service.
//!
//! Every tick classifies the service as in breach, steady, or comfortably
//! inside its objective. A missing or stale reading is a breach: the
//! controller never gives service cores away on data it does not have.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use cosched_core::config::{SloConfig, SloMetric};
use cosched_core::{CoreSet, Timestamp};
use cosched_telemetry::TelemetrySample;

/// Verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    /// Over the threshold, or no usable reading.
    Breach,
    /// Within the objective but not comfortably.
    Steady,
    /// Comfortably under the threshold.
    Comfortable,
}

/// One valid reading kept in the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SloReading {
    pub at: Timestamp,
    /// Latency in microseconds, or CPU percent, per the configured metric.
    pub value: f64,
    pub qps: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SloVerdict {
    pub pressure: Pressure,
    /// The reading the verdict is based on, if there was one.
    pub value: Option<f64>,
    /// True when the newest sample is older than `stale_after`.
    pub stale: bool,
    pub comfortable_streak: u32,
    /// Readings in the rolling window and the worst of them.
    pub window_len: usize,
    pub window_max: Option<f64>,
}

#[derive(Debug)]
pub struct SloTracker {
    config: SloConfig,
    window: VecDeque<SloReading>,
    comfortable_streak: u32,
}

impl SloTracker {
    pub fn new(config: SloConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            config,
            comfortable_streak: 0,
        }
    }

    /// Classify the newest sample.
    ///
    /// `sample` is the last good telemetry sample with the time it was
    /// received; `service_cores` are the cores the service holds now.
    pub fn observe(
        &mut self,
        sample: Option<(&TelemetrySample, Timestamp)>,
        service_cores: &CoreSet,
        now: Timestamp,
    ) -> SloVerdict {
        let stale_after = self.config.stale_after.as_millis() as u64;
        let stale = sample.is_none_or(|(_, at)| now.saturating_sub(at) > stale_after);

        let value = match sample {
            Some((s, _)) if !stale => self.signal(s, service_cores),
            _ => None,
        };

        let pressure = match value {
            None => Pressure::Breach,
            Some(v) => {
                if self.window.len() == self.config.window {
                    self.window.pop_front();
                }
                let qps = sample.and_then(|(s, _)| s.service.reading().and_then(|r| r.qps));
                self.window.push_back(SloReading { at: now, value: v, qps });
                self.classify(v)
            }
        };

        if pressure == Pressure::Comfortable {
            self.comfortable_streak += 1;
        } else {
            self.comfortable_streak = 0;
        }

        debug!(?pressure, value = ?value, stale, streak = self.comfortable_streak, "slo observed");
        SloVerdict {
            pressure,
            value,
            stale,
            comfortable_streak: self.comfortable_streak,
            window_len: self.window.len(),
            window_max: self.window_max(),
        }
    }

    /// Whether the comfortable streak has lasted `hysteresis_ticks`.
    pub fn shrink_due(&self, hysteresis_ticks: u32) -> bool {
        self.comfortable_streak >= hysteresis_ticks
    }

    /// Start counting again after the service has shrunk.
    pub fn reset_streak(&mut self) {
        self.comfortable_streak = 0;
    }

    fn window_max(&self) -> Option<f64> {
        self.window.iter().map(|r| r.value).reduce(f64::max)
    }

    fn signal(&self, sample: &TelemetrySample, service_cores: &CoreSet) -> Option<f64> {
        match self.config.metric {
            SloMetric::Latency => sample.service.reading().and_then(|r| r.latency_us),
            SloMetric::Cpu => sample.utilization_of(service_cores),
        }
    }

    fn classify(&self, value: f64) -> Pressure {
        let (high, low) = match self.config.metric {
            SloMetric::Latency => (
                self.config.threshold_us,
                self.config.threshold_us * self.config.comfort_ratio,
            ),
            SloMetric::Cpu => (self.config.cpu_high_pct, self.config.cpu_low_pct),
        };
        if value > high {
            Pressure::Breach
        } else if value < low {
            Pressure::Comfortable
        } else {
            Pressure::Steady
        }
    }
}
