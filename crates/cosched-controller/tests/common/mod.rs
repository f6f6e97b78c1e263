#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cosched_controller::{Controller, EventSink, MemorySink, TickReport};
use cosched_core::{CoreSet, CoschedConfig, Timestamp, UnitId};
use cosched_executor::{MockRuntime, Timeouts, WorkloadExecutor};
use cosched_telemetry::{
    ServiceReading, ServiceStats, TelemetryResult, TelemetrySample, TelemetrySource,
};

pub const SERVICE_PID: u32 = 4242;
pub const TICK_MS: Timestamp = 2_000;

pub const GOOD: f64 = 200.0;
pub const OK: f64 = 900.0;
pub const BAD: f64 = 5_000.0;

/// Latency readings handed out one per sample. The last one repeats once
/// the queue runs dry; with nothing scripted the service is unreadable.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTelemetry {
    script: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<f64>,
    last: Option<f64>,
}

impl ScriptedTelemetry {
    pub fn push(&self, latencies: &[f64]) {
        self.script.lock().unwrap().queue.extend(latencies);
    }

    /// Drop anything queued and report `latency` from now on.
    pub fn set(&self, latency: f64) {
        let mut script = self.script.lock().unwrap();
        script.queue.clear();
        script.last = Some(latency);
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn sample(&mut self, _pids: &[u32]) -> TelemetryResult<TelemetrySample> {
        let mut script = self.script.lock().unwrap();
        if let Some(next) = script.queue.pop_front() {
            script.last = Some(next);
        }
        let mut sample = TelemetrySample::unavailable(0, "nothing scripted");
        if let Some(latency) = script.last {
            sample.service = ServiceStats::Available(ServiceReading {
                latency_us: Some(latency),
                qps: Some(50_000.0),
                total_ops: 0,
            });
        }
        Ok(sample)
    }
}

/// A cosched.toml with the service pinned by pid and the given sections.
pub fn config_toml(host_cores: &str, service: &str, controller: &str, jobs: &str) -> String {
    format!(
        r#"
[host]
cores = "{host_cores}"

[service]
pid = {SERVICE_PID}
stats_addr = "127.0.0.1:11211"
{service}

[service.slo]
threshold_us = 1000.0
comfort_ratio = 0.5

[controller]
{controller}

[executor]
call_timeout = "1s"
stop_grace = "3s"

{jobs}
"#
    )
}

pub fn parse(toml: &str) -> CoschedConfig {
    toml.parse().unwrap()
}

pub struct Harness {
    pub ctl: Controller,
    pub mock: Arc<MockRuntime>,
    pub telemetry: ScriptedTelemetry,
    pub events: MemorySink,
    pub now: Timestamp,
}

impl Harness {
    pub async fn new(toml: &str) -> Self {
        let events = MemorySink::new();
        let mut h = Self::with_sink(toml, Box::new(events.clone())).await;
        h.events = events;
        h
    }

    pub async fn with_sink(toml: &str, sink: Box<dyn EventSink>) -> Self {
        let config = parse(toml);
        let inventory = config.host.cores.clone().unwrap();
        let jobs = config.validate(&inventory, Vec::new()).unwrap();

        let mock = Arc::new(MockRuntime::new());
        let executor = WorkloadExecutor::new(mock.clone(), Timeouts::from(&config.executor));
        let telemetry = ScriptedTelemetry::default();

        let mut ctl = Controller::new(&config, inventory, jobs, executor, Box::new(telemetry.clone()))
            .unwrap()
            .with_event_sink(sink);
        ctl.attach_service(SERVICE_PID).await.unwrap();

        Self {
            ctl,
            mock,
            telemetry,
            events: MemorySink::new(),
            now: 0,
        }
    }

    /// One tick, then check the partition against itself and the runtime.
    pub async fn tick(&mut self) -> TickReport {
        self.now += TICK_MS;
        let report = self.ctl.tick(self.now).await.unwrap();
        self.check_partition();
        report
    }

    pub async fn tick_with(&mut self, latency: f64) -> TickReport {
        self.telemetry.set(latency);
        self.tick().await
    }

    pub fn check_partition(&self) {
        let p = self.ctl.partition();
        p.validate().unwrap();
        assert_eq!(
            self.mock.cores_of(&UnitId::Service).as_ref(),
            Some(p.service()),
            "service affinity diverged from the partition"
        );
        for (job, cores) in p.jobs() {
            assert_eq!(
                self.mock.cores_of(&UnitId::job(job)).as_ref(),
                Some(cores),
                "affinity of {job} diverged from the partition"
            );
        }
    }

    pub fn service(&self) -> CoreSet {
        self.ctl.partition().service().clone()
    }

    pub fn job_cores(&self, job: &str) -> CoreSet {
        self.ctl.partition().job(job)
    }
}

pub fn cores(s: &str) -> CoreSet {
    s.parse().unwrap()
}
