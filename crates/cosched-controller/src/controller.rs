//! The control loop.
//!
//! One [`Controller::tick`] runs Observe → Reap → Admit → Allocate → Act →
//! Record against an injected timestamp. [`Controller::run`] drives ticks on
//! a fixed period until every job has settled or shutdown is signalled, then
//! drains.
//!
//! The controller owns the [`CorePartition`]. It only changes the partition
//! after the executor call that makes the change real has succeeded, so the
//! partition always describes what the units are actually pinned to.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cosched_core::config::ControllerConfig;
use cosched_core::{
    CorePartition, CoreSet, CoschedConfig, ErrorKind, Holder, JobSet, JobState, Timestamp, UnitId,
    UnitStatus, epoch_millis,
};
use cosched_executor::{ExecutorError, LaunchSpec, StopOutcome, WorkloadExecutor};
use cosched_graph::DependencyGraph;
use cosched_telemetry::{ServiceStats, TelemetrySample, TelemetrySource};

use crate::allocator::{self, AllocationPlan, AllocationPolicy, JobView};
use crate::error::ControllerResult;
use crate::event::{Action, Event, EventRecord, EventSink, TracingSink};
use crate::slo::{Pressure, SloTracker, SloVerdict};
use crate::snapshot::{JobOutcome, JobSummary, JobTiming, RunSummary, Snapshot};

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub pressure: Pressure,
    pub actions: Vec<Action>,
    /// Nothing is left that could still run.
    pub settled: bool,
}

pub struct Controller {
    config: ControllerConfig,
    stop_grace: Duration,
    jobs: JobSet,
    graph: DependencyGraph,
    partition: CorePartition,
    policy: AllocationPolicy,
    executor: WorkloadExecutor,
    telemetry: Box<dyn TelemetrySource>,
    slo: SloTracker,
    sink: Box<dyn EventSink>,
    /// Last sample received, with the time it arrived.
    last_sample: Option<(Timestamp, TelemetrySample)>,
    timings: BTreeMap<String, JobTiming>,
    /// Consecutive ticks each job has failed to answer a status probe.
    silent_ticks: BTreeMap<String, u32>,
    tick: u64,
    breach_ticks: u64,
    forced_stops: usize,
    started_at: Option<Timestamp>,
}

impl Controller {
    /// Build the controller. Fails on a cyclic job graph or a service
    /// reservation outside the inventory, before anything is launched.
    pub fn new(
        config: &CoschedConfig,
        inventory: CoreSet,
        jobs: JobSet,
        executor: WorkloadExecutor,
        telemetry: Box<dyn TelemetrySource>,
    ) -> ControllerResult<Self> {
        let graph = DependencyGraph::new(&jobs)?;
        let service = config.initial_service_cores(&inventory);
        let policy = AllocationPolicy::new(
            &config.controller,
            config.service.min_cores,
            config.service_max_cores(&inventory),
        );
        let partition = CorePartition::new(inventory, service)?;

        Ok(Self {
            config: config.controller.clone(),
            stop_grace: config.executor.stop_grace,
            jobs,
            graph,
            partition,
            policy,
            executor,
            telemetry,
            slo: SloTracker::new(config.service.slo.clone()),
            sink: Box::new(TracingSink),
            last_sample: None,
            timings: BTreeMap::new(),
            silent_ticks: BTreeMap::new(),
            tick: 0,
            breach_ticks: 0,
            forced_stops: 0,
            started_at: None,
        })
    }

    pub fn with_event_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adopt the running service and pin it to its initial reservation.
    pub async fn attach_service(&mut self, pid: u32) -> ControllerResult<()> {
        let cores = self.partition.service().clone();
        self.executor.attach_service(pid, &cores).await?;
        Ok(())
    }

    // ── Tick ────────────────────────────────────────────────────

    pub async fn tick(&mut self, now: Timestamp) -> ControllerResult<TickReport> {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            let event = Event::Started {
                inventory: self.partition.inventory().clone(),
                service_cores: self.partition.service().clone(),
                jobs: self.graph.len(),
            };
            self.emit(now, event);
        }
        self.tick += 1;
        let mut actions = Vec::new();

        let (verdict, fresh) = self.observe(now).await;
        self.reap(now, &mut actions).await?;
        self.admit(&mut actions)?;

        let shrink_due = self.slo.shrink_due(self.config.hysteresis_ticks);
        let service_frozen = self.executor.is_unresponsive(&UnitId::Service);
        let plan = allocator::allocate(
            &self.partition,
            &self.job_views(),
            verdict.pressure,
            shrink_due,
            service_frozen,
            &self.policy,
        )?;
        debug!(
            service = ?plan.service,
            start = ?plan.start,
            pause = ?plan.pause,
            resume = ?plan.resume,
            "allocation planned"
        );
        self.act(plan, now, &mut actions).await?;
        self.partition.validate()?;

        if actions.iter().any(|a| matches!(a, Action::ServiceShrank { .. })) {
            self.slo.reset_streak();
        }
        if verdict.pressure == Pressure::Breach {
            self.breach_ticks += 1;
        }

        let snapshot = Snapshot {
            tick: self.tick,
            at: now,
            telemetry: self.last_sample.as_ref().map(|(_, s)| s.clone()),
            telemetry_fresh: fresh,
            slo: verdict,
            partition: self.partition.clone(),
            jobs: self.job_states(),
            blocked: self
                .graph
                .blocked_jobs()
                .into_iter()
                .map(|b| (b.job, b.failed_prerequisite))
                .collect(),
        };
        debug!(
            tick = self.tick,
            pressure = ?verdict.pressure,
            service = %self.partition.service(),
            idle = %self.partition.idle(),
            actions = actions.len(),
            "tick complete"
        );
        self.emit(
            now,
            Event::Tick {
                snapshot: Box::new(snapshot),
                actions: actions.clone(),
            },
        );

        Ok(TickReport {
            tick: self.tick,
            pressure: verdict.pressure,
            actions,
            settled: self.graph.is_settled(),
        })
    }

    /// Sample telemetry and classify the SLO. The flag says whether a new
    /// sample arrived this tick.
    async fn observe(&mut self, now: Timestamp) -> (SloVerdict, bool) {
        let pids = self.executor.live_pids();
        let fresh = match self.telemetry.sample(&pids).await {
            Ok(sample) => {
                if let ServiceStats::Unavailable { reason } = &sample.service {
                    let message = format!("service stats unavailable: {reason}");
                    let kind = ErrorKind::TelemetryUnavailable;
                    self.record_error(now, Some(UnitId::Service), kind, message);
                }
                self.last_sample = Some((now, sample));
                true
            }
            Err(e) => {
                // Keep the host view; the service reading is gone.
                if let Some((_, sample)) = &mut self.last_sample {
                    sample.service = ServiceStats::Unavailable {
                        reason: e.to_string(),
                    };
                }
                self.record_error(now, None, ErrorKind::TelemetryUnavailable, e.to_string());
                false
            }
        };

        let sample = self.last_sample.as_ref().map(|(at, s)| (s, *at));
        let verdict = self.slo.observe(sample, self.partition.service(), now);
        (verdict, fresh)
    }

    /// Collect exits and give up on jobs that stopped answering.
    async fn reap(&mut self, now: Timestamp, actions: &mut Vec<Action>) -> ControllerResult<()> {
        self.probe_service().await;

        let live: Vec<String> = [JobState::Running, JobState::Paused]
            .into_iter()
            .flat_map(|s| self.graph.jobs_in(s))
            .map(str::to_string)
            .collect();

        for job in live {
            let unit = UnitId::job(&job);
            match self.executor.status(&unit).await {
                Ok(UnitStatus::Exited(0)) => {
                    self.silent_ticks.remove(&job);
                    let unlocked = self.graph.on_job_completed(&job)?;
                    self.end_job(&job, now).await;
                    info!(%job, unlocked = ?unlocked, "job completed");
                    actions.push(Action::JobCompleted { job });
                }
                Ok(UnitStatus::Exited(code)) => {
                    let reason = format!("exited with code {code}");
                    self.fail_job(&job, reason, now, actions).await?;
                }
                Ok(UnitStatus::Running | UnitStatus::Paused) => {
                    self.silent_ticks.remove(&job);
                }
                status => {
                    let detail = match status {
                        Err(e) => e.to_string(),
                        _ => "status probe timed out".to_string(),
                    };
                    let count = self.silent_ticks.entry(job.clone()).or_default();
                    *count += 1;
                    let count = *count;
                    warn!(%job, count, detail = %detail, "job unresponsive");
                    if count < self.config.unresponsive_ticks {
                        continue;
                    }

                    let message = format!("unresponsive for {count} ticks: {detail}");
                    let kind = ErrorKind::ReassignTimeout;
                    self.record_error(now, Some(unit.clone()), kind, message.clone());
                    if let Err(e) = self.executor.stop(&unit, Duration::ZERO).await {
                        warn!(%job, error = %e, "stopping unresponsive job failed");
                    }
                    self.fail_job(&job, message, now, actions).await?;
                }
            }
        }
        Ok(())
    }

    /// Contact the service every tick. A successful probe lifts the
    /// exclusion a timed-out reassignment put on it.
    async fn probe_service(&mut self) {
        let unit = UnitId::Service;
        if !self.executor.contains(&unit) {
            return;
        }
        let was_frozen = self.executor.is_unresponsive(&unit);
        match self.executor.status(&unit).await {
            Ok(UnitStatus::Exited(code)) => warn!(code, "service process has exited"),
            Ok(status) => {
                if was_frozen && !self.executor.is_unresponsive(&unit) {
                    info!(status = ?status, "service answering again");
                }
            }
            Err(e) => warn!(error = %e, "service status probe failed"),
        }
    }

    fn admit(&mut self, actions: &mut Vec<Action>) -> ControllerResult<()> {
        for job in self.graph.admissible_jobs() {
            self.graph.mark_ready(&job)?;
            debug!(%job, "job ready");
            actions.push(Action::JobReady { job });
        }
        Ok(())
    }

    /// Apply the plan, committing each change to the partition only once the
    /// executor has made it.
    async fn act(
        &mut self,
        plan: AllocationPlan,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ControllerResult<()> {
        let target = plan.partition;

        // Jobs yielding everything.
        for job in &plan.pause {
            let unit = UnitId::job(job);
            match self.executor.pause(&unit).await {
                Ok(()) => {
                    self.graph.mark_paused(job)?;
                    self.timing(job).on_pause(now);
                    let freed = self.partition.release_job(job);
                    info!(%job, freed = %freed, "job paused");
                    actions.push(Action::JobPaused { job: job.clone() });
                }
                Err(e) => self.record_unit_error(now, &unit, &e),
            }
        }

        // Jobs losing some cores.
        let held: Vec<(String, CoreSet)> = self
            .partition
            .jobs()
            .iter()
            .map(|(j, c)| (j.clone(), c.clone()))
            .collect();
        for (job, cores) in held {
            let keep = cores.intersection(&target.job(&job));
            if keep == cores || keep.is_empty() {
                continue;
            }
            let unit = UnitId::job(&job);
            if self.reassign(&unit, &keep, now, actions).await {
                self.partition
                    .transfer(&cores.difference(&keep), &Holder::Job(job), &Holder::Idle)?;
            }
        }

        // The service.
        let current = self.partition.service().clone();
        let wanted = target.service();
        let next = current
            .intersection(wanted)
            .union(&wanted.difference(&current).intersection(self.partition.idle()));
        if next != current && self.reassign(&UnitId::Service, &next, now, actions).await {
            let released = current.difference(&next);
            let gained = next.difference(&current);
            self.partition
                .transfer(&released, &Holder::Service, &Holder::Idle)?;
            self.partition
                .transfer(&gained, &Holder::Idle, &Holder::Service)?;
            if !gained.is_empty() {
                info!(gained = %gained, service = %next, "service grew");
                actions.push(Action::ServiceGrew { cores: gained });
            }
            if !released.is_empty() {
                info!(released = %released, service = %next, "service shrank");
                actions.push(Action::ServiceShrank { cores: released });
            }
        }

        // Running jobs gaining cores.
        for (job, wanted) in target.jobs() {
            let current = self.partition.job(job);
            if current.is_empty() {
                continue;
            }
            let add = wanted.difference(&current).intersection(self.partition.idle());
            if add.is_empty() {
                continue;
            }
            let unit = UnitId::job(job);
            if self.reassign(&unit, &current.union(&add), now, actions).await {
                self.partition
                    .transfer(&add, &Holder::Idle, &Holder::Job(job.clone()))?;
            }
        }

        for job in &plan.resume {
            let cores = target.job(job).intersection(self.partition.idle());
            if cores.is_empty() {
                continue;
            }
            let unit = UnitId::job(job);
            let resumed = match self.executor.reassign_cores(&unit, &cores).await {
                Ok(()) => self.executor.resume(&unit).await,
                Err(e) => Err(e),
            };
            match resumed {
                Ok(()) => {
                    self.partition
                        .transfer(&cores, &Holder::Idle, &Holder::Job(job.clone()))?;
                    self.graph.mark_running(job)?;
                    self.timing(job).on_resume(now);
                    info!(%job, cores = %cores, "job resumed");
                    actions.push(Action::JobResumed {
                        job: job.clone(),
                        cores,
                    });
                }
                Err(e) => self.record_unit_error(now, &unit, &e),
            }
        }

        for job in &plan.start {
            let cores = target.job(job).intersection(self.partition.idle());
            let Some(spec) = self.jobs.get(job) else {
                continue;
            };
            if cores.is_empty() {
                continue;
            }
            let launch = LaunchSpec::for_job(spec, &cores);
            match self.executor.start(launch).await {
                Ok(handle) => {
                    self.partition
                        .transfer(&cores, &Holder::Idle, &Holder::Job(job.clone()))?;
                    self.graph.mark_running(job)?;
                    self.timing(job).on_start(now);
                    info!(%job, cores = %cores, pid = ?handle.pid, "job started");
                    actions.push(Action::JobStarted {
                        job: job.clone(),
                        cores,
                    });
                }
                Err(e) => {
                    let unit = UnitId::job(job);
                    self.record_unit_error(now, &unit, &e);
                    self.fail_job(job, e.to_string(), now, actions).await?;
                }
            }
        }
        Ok(())
    }

    /// Move a live unit to `cores`. Failures are recorded, not returned.
    async fn reassign(
        &mut self,
        unit: &UnitId,
        cores: &CoreSet,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> bool {
        match self.executor.reassign_cores(unit, cores).await {
            Ok(()) => {
                actions.push(Action::CoresReassigned {
                    unit: unit.clone(),
                    cores: cores.clone(),
                });
                true
            }
            Err(e) => {
                self.record_unit_error(now, unit, &e);
                false
            }
        }
    }

    // ── Drain ───────────────────────────────────────────────────

    /// Drive ticks every `tick_period` until all jobs settle or `shutdown`
    /// flips, then drain.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<RunSummary> {
        let period = self.config.tick_period;
        info!(period = ?period, jobs = self.graph.len(), "control loop started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown requested; draining");
                    break;
                }
                scheduled = ticker.tick() => {
                    let drift = scheduled.elapsed();
                    if drift > self.config.drift_warn {
                        warn!(drift = ?drift, "control loop running behind");
                    }
                    match self.tick(epoch_millis()).await {
                        Ok(report) if report.settled => {
                            info!(ticks = report.tick, "all jobs settled");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => error!(tick = self.tick, error = %e, "tick failed"),
                    }
                }
            }
        }

        self.drain(epoch_millis()).await
    }

    /// Stop every job unit and release its cores. Units that outlive the
    /// grace period are killed and recorded as shutdown timeouts.
    pub async fn drain(&mut self, now: Timestamp) -> ControllerResult<RunSummary> {
        let live = self.graph.jobs_in(JobState::Running).len()
            + self.graph.jobs_in(JobState::Paused).len();
        info!(live_jobs = live, grace = ?self.stop_grace, "draining");
        self.emit(now, Event::DrainStarted { live_jobs: live });

        let report = self.executor.stop_all(self.stop_grace).await;
        let mut actions = Vec::new();
        for (unit, outcome) in &report.outcomes {
            let UnitId::Job(job) = unit else {
                continue;
            };
            let forced = *outcome == StopOutcome::Forced;
            if forced {
                self.forced_stops += 1;
                let message = format!("did not exit within {:?}; killed", self.stop_grace);
                self.record_error(now, Some(unit.clone()), ErrorKind::ShutdownTimeout, message);
            }
            self.partition.release_job(job);
            self.timing(job).on_end(now);
            actions.push(Action::JobStopped {
                job: job.clone(),
                forced,
            });
        }

        // Nothing may stay pinned to a unit that no longer exists.
        let leftover: Vec<String> = self.partition.jobs().keys().cloned().collect();
        for job in leftover {
            let freed = self.partition.release_job(&job);
            warn!(%job, freed = %freed, "released cores of a job the executor no longer tracks");
        }
        self.partition.validate()?;

        self.emit(
            now,
            Event::Drained {
                actions,
                partition: self.partition.clone(),
            },
        );

        let summary = self.summary(now);
        info!(
            ticks = summary.ticks,
            completed = summary.count(JobOutcome::Completed),
            failed = summary.count(JobOutcome::Failed),
            blocked = summary.count(JobOutcome::Blocked),
            forced_stops = summary.forced_stops,
            "drained"
        );
        self.emit(
            now,
            Event::Finished {
                summary: summary.clone(),
            },
        );
        Ok(summary)
    }

    pub fn summary(&self, now: Timestamp) -> RunSummary {
        let mut jobs = BTreeMap::new();
        for name in self.graph.topological_order() {
            let timing = self.timings.get(name).copied().unwrap_or_default();
            let outcome = match self.graph.state(name) {
                Some(JobState::Completed) => JobOutcome::Completed,
                Some(JobState::Failed) => JobOutcome::Failed,
                _ if self.graph.is_blocked(name) => JobOutcome::Blocked,
                _ if timing.started_at.is_some() => JobOutcome::Stopped,
                _ => JobOutcome::NotStarted,
            };
            jobs.insert(
                name.to_string(),
                JobSummary {
                    outcome,
                    started_at: timing.started_at,
                    ended_at: timing.ended_at,
                    run_time_ms: timing.run_time_ms(),
                    paused_ms: timing.paused_total_ms,
                },
            );
        }

        let first = jobs.values().filter_map(|j| j.started_at).min();
        let last = jobs.values().filter_map(|j| j.ended_at).max();
        RunSummary {
            ticks: self.tick,
            started_at: self.started_at.unwrap_or(now),
            finished_at: now,
            makespan_ms: first.zip(last).map(|(f, l)| l.saturating_sub(f)),
            breach_ticks: self.breach_ticks,
            forced_stops: self.forced_stops,
            jobs,
        }
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn partition(&self) -> &CorePartition {
        &self.partition
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn executor(&self) -> &WorkloadExecutor {
        &self.executor
    }

    pub fn job_state(&self, job: &str) -> Option<JobState> {
        self.graph.state(job)
    }

    pub fn job_timing(&self, job: &str) -> Option<&JobTiming> {
        self.timings.get(job)
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn slo(&self) -> &SloTracker {
        &self.slo
    }

    // ── Internal helpers ────────────────────────────────────────

    fn job_views(&self) -> Vec<JobView> {
        let inventory = self.partition.inventory();
        self.graph
            .topological_order()
            .into_iter()
            .enumerate()
            .filter_map(|(rank, name)| {
                let state = self.graph.state(name)?;
                if !matches!(state, JobState::Ready | JobState::Running | JobState::Paused) {
                    return None;
                }
                let spec = self.jobs.get(name)?;
                let allowed = spec.allowed_cores(inventory);
                Some(JobView {
                    name: name.to_string(),
                    state,
                    rank,
                    started_at: self.timings.get(name).and_then(|t| t.started_at),
                    max_cores: spec.max_cores().min(allowed.len()),
                    allowed,
                    frozen: self.executor.is_unresponsive(&UnitId::job(name)),
                })
            })
            .collect()
    }

    fn job_states(&self) -> BTreeMap<String, JobState> {
        self.graph
            .topological_order()
            .into_iter()
            .filter_map(|name| Some((name.to_string(), self.graph.state(name)?)))
            .collect()
    }

    fn timing(&mut self, job: &str) -> &mut JobTiming {
        self.timings.entry(job.to_string()).or_default()
    }

    /// Release a finished job's cores and whatever the executor holds.
    async fn end_job(&mut self, job: &str, now: Timestamp) {
        self.partition.release_job(job);
        if self.timings.contains_key(job) {
            self.timing(job).on_end(now);
        }
        let unit = UnitId::job(job);
        if self.executor.contains(&unit) {
            self.executor.release(&unit).await;
        }
    }

    async fn fail_job(
        &mut self,
        job: &str,
        reason: String,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ControllerResult<()> {
        self.silent_ticks.remove(job);
        let blocked = self.graph.on_job_failed(job)?;
        self.end_job(job, now).await;
        warn!(%job, reason = %reason, blocked = ?blocked, "job failed");
        actions.push(Action::JobFailed {
            job: job.to_string(),
            reason,
        });
        for dependent in blocked {
            actions.push(Action::JobBlocked {
                job: dependent,
                failed_prerequisite: job.to_string(),
            });
        }
        Ok(())
    }

    fn record_unit_error(&mut self, now: Timestamp, unit: &UnitId, e: &ExecutorError) {
        self.record_error(now, Some(unit.clone()), e.kind(), e.to_string());
    }

    fn record_error(
        &mut self,
        now: Timestamp,
        unit: Option<UnitId>,
        kind: ErrorKind,
        message: String,
    ) {
        warn!(unit = ?unit, kind = %kind, message = %message, "recovered error");
        self.emit(
            now,
            Event::Error {
                unit,
                kind,
                message,
            },
        );
    }

    fn emit(&mut self, now: Timestamp, event: Event) {
        let record = EventRecord {
            at: now,
            tick: self.tick,
            event,
        };
        if let Err(e) = self.sink.record(&record) {
            warn!(error = %e, "event log write failed");
        }
    }
}
