//! Core allocation.
//!
//! [`allocate`] is a pure function from the current partition, the SLO
//! verdict and a view of every schedulable job to the partition the control
//! loop should move to. It never talks to the executor.
//!
//! Policy, in order:
//!
//! 1. Breach: the service grows by up to `grow_step` cores, from idle cores
//!    first, then from running jobs, most recently started first, each down
//!    to `job_floor` before the next loses anything. If that is still not
//!    enough, jobs are paused in the same order.
//! 2. Comfortable for long enough: the service gives back up to
//!    `shrink_step` of its highest-numbered cores, never below its minimum.
//! 3. Unless in breach, idle cores go to running jobs (up to their thread
//!    count), then to paused jobs, then to ready jobs, each group in
//!    topological order.
//!
//! Jobs marked frozen (unresponsive) keep exactly what they hold. A frozen
//! service neither grows nor shrinks; under breach nothing moves until it
//! answers again.

use std::cmp::Reverse;

use serde::Serialize;

use cosched_core::config::{ControllerConfig, TieBreak};
use cosched_core::{CorePartition, CoreSet, Holder, JobState, PartitionError, Timestamp};

use crate::slo::Pressure;

/// Knobs for [`allocate`].
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    pub grow_step: usize,
    pub shrink_step: usize,
    pub service_min: usize,
    pub service_max: usize,
    pub job_floor: usize,
    pub pause_on_exhaustion: bool,
    pub tie_break: TieBreak,
}

impl AllocationPolicy {
    pub fn new(controller: &ControllerConfig, service_min: usize, service_max: usize) -> Self {
        Self {
            grow_step: controller.grow_step,
            shrink_step: controller.shrink_step,
            service_min,
            service_max,
            job_floor: controller.job_floor_cores.max(1),
            pause_on_exhaustion: controller.pause_on_exhaustion,
            tie_break: controller.tie_break,
        }
    }
}

/// What the allocator needs to know about one job.
#[derive(Debug, Clone)]
pub struct JobView {
    pub name: String,
    /// Ready, Running or Paused. Other states are ignored.
    pub state: JobState,
    /// Position in the topological order.
    pub rank: usize,
    pub started_at: Option<Timestamp>,
    /// Most cores worth giving the job.
    pub max_cores: usize,
    pub allowed: CoreSet,
    /// Unresponsive: neither reclaimed from nor grown.
    pub frozen: bool,
}

impl JobView {
    /// Fewest cores the job is started or resumed with.
    fn min_cores(&self, floor: usize) -> usize {
        floor.min(self.max_cores).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", content = "cores", rename_all = "snake_case")]
pub enum ServiceChange {
    Unchanged,
    Grew(usize),
    Shrank(usize),
}

#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub partition: CorePartition,
    /// Ready jobs to launch with their cores in `partition`.
    pub start: Vec<String>,
    /// Running jobs that lost every core.
    pub pause: Vec<String>,
    /// Paused jobs to continue with their cores in `partition`.
    pub resume: Vec<String>,
    pub service: ServiceChange,
}

/// Compute the next partition. `shrink_due` says the hysteresis period has
/// passed; `service_frozen` says the service cannot be repinned.
pub fn allocate(
    current: &CorePartition,
    jobs: &[JobView],
    pressure: Pressure,
    shrink_due: bool,
    service_frozen: bool,
    policy: &AllocationPolicy,
) -> Result<AllocationPlan, PartitionError> {
    let mut p = current.clone();
    let mut start = Vec::new();
    let mut pause = Vec::new();
    let mut resume = Vec::new();
    let mut service = ServiceChange::Unchanged;

    let mut by_rank: Vec<&JobView> = jobs.iter().collect();
    by_rank.sort_by_key(|j| j.rank);

    match pressure {
        _ if service_frozen => {}
        Pressure::Breach => {
            let before = p.service().len();
            grow_service(&mut p, jobs, policy, &mut pause)?;
            let grew = p.service().len() - before;
            if grew > 0 {
                service = ServiceChange::Grew(grew);
            }
        }
        Pressure::Comfortable if shrink_due => {
            let excess = p.service().len().saturating_sub(policy.service_min);
            let n = policy.shrink_step.min(excess);
            if n > 0 {
                let give = p.service().highest(n);
                p.transfer(&give, &Holder::Service, &Holder::Idle)?;
                service = ServiceChange::Shrank(n);
            }
        }
        _ => {}
    }

    if pressure != Pressure::Breach {
        // Running jobs first, up to what their threads can use.
        for job in by_rank
            .iter()
            .filter(|j| j.state == JobState::Running && !j.frozen)
        {
            let holder = Holder::Job(job.name.clone());
            let want = job.max_cores.saturating_sub(p.job(&job.name).len());
            let give = p.idle().intersection(&job.allowed).lowest(want);
            p.transfer(&give, &Holder::Idle, &holder)?;
        }

        // Then paused jobs, then new ones.
        for (state, admitted) in [
            (JobState::Paused, &mut resume),
            (JobState::Ready, &mut start),
        ] {
            for job in by_rank.iter().filter(|j| j.state == state && !j.frozen) {
                let available = p.idle().intersection(&job.allowed);
                if available.len() < job.min_cores(policy.job_floor) {
                    continue;
                }
                let give = available.lowest(job.max_cores.max(1));
                p.transfer(&give, &Holder::Idle, &Holder::Job(job.name.clone()))?;
                admitted.push(job.name.clone());
            }
        }
    }

    p.validate()?;
    Ok(AllocationPlan {
        partition: p,
        start,
        pause,
        resume,
        service,
    })
}

fn grow_service(
    p: &mut CorePartition,
    jobs: &[JobView],
    policy: &AllocationPolicy,
    paused: &mut Vec<String>,
) -> Result<(), PartitionError> {
    let room = policy.service_max.saturating_sub(p.service().len());
    let mut need = policy.grow_step.min(room);
    if need == 0 {
        return Ok(());
    }

    let from_idle = p.idle().lowest(need);
    need -= from_idle.len();
    p.transfer(&from_idle, &Holder::Idle, &Holder::Service)?;

    let victims = victim_order(p, jobs, policy.tie_break);

    for name in &victims {
        if need == 0 {
            return Ok(());
        }
        let held = p.job(name);
        let spare = held.len().saturating_sub(policy.job_floor);
        let take = held.lowest(spare.min(need));
        need -= take.len();
        p.transfer(&take, &Holder::Job(name.clone()), &Holder::Service)?;
    }

    if !policy.pause_on_exhaustion {
        return Ok(());
    }
    for name in &victims {
        if need == 0 {
            break;
        }
        let holder = Holder::Job(name.clone());
        let take = p.job(name).lowest(need);
        need -= take.len();
        p.transfer(&take, &holder, &Holder::Service)?;
        let rest = p.job(name);
        p.transfer(&rest, &holder, &Holder::Idle)?;
        paused.push(name.clone());
    }
    Ok(())
}

/// Running, responsive jobs holding cores, in the order they give cores up:
/// most recently started first.
fn victim_order(p: &CorePartition, jobs: &[JobView], tie_break: TieBreak) -> Vec<String> {
    let mut victims: Vec<(&JobView, usize)> = jobs
        .iter()
        .filter(|j| j.state == JobState::Running && !j.frozen)
        .map(|j| (j, p.job(&j.name).len()))
        .filter(|(_, held)| *held > 0)
        .collect();

    victims.sort_by(|(a, a_held), (b, b_held)| {
        let recency = Reverse(a.started_at).cmp(&Reverse(b.started_at));
        let tie = match tie_break {
            TieBreak::Name => b.name.cmp(&a.name),
            TieBreak::MostCores => b_held.cmp(a_held).then_with(|| b.name.cmp(&a.name)),
        };
        recency.then(tie)
    });
    victims.into_iter().map(|(j, _)| j.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AllocationPolicy {
        AllocationPolicy {
            grow_step: 1,
            shrink_step: 1,
            service_min: 1,
            service_max: 8,
            job_floor: 1,
            pause_on_exhaustion: true,
            tie_break: TieBreak::Name,
        }
    }

    fn view(name: &str, state: JobState, rank: usize, started_at: Option<Timestamp>) -> JobView {
        JobView {
            name: name.to_string(),
            state,
            rank,
            started_at,
            max_cores: 2,
            allowed: CoreSet::range(0, 7),
            frozen: false,
        }
    }

    /// Inventory 0-4, service {0}, `a` holds {1,2}, `b` holds {3,4}.
    fn two_running() -> CorePartition {
        let mut p = CorePartition::new(CoreSet::range(0, 4), CoreSet::from([0])).unwrap();
        p.transfer(&CoreSet::from([1, 2]), &Holder::Idle, &Holder::Job("a".into()))
            .unwrap();
        p.transfer(&CoreSet::from([3, 4]), &Holder::Idle, &Holder::Job("b".into()))
            .unwrap();
        p
    }

    #[test]
    fn frozen_service_is_left_alone() {
        let p = two_running();
        let jobs = vec![
            view("a", JobState::Running, 0, Some(1)),
            view("b", JobState::Running, 1, Some(2)),
        ];

        let plan = allocate(&p, &jobs, Pressure::Breach, false, true, &policy()).unwrap();
        assert_eq!(plan.service, ServiceChange::Unchanged);
        assert_eq!(plan.partition, p);
        assert!(plan.pause.is_empty());

        let plan = allocate(&p, &jobs, Pressure::Comfortable, true, true, &policy()).unwrap();
        assert_eq!(plan.service, ServiceChange::Unchanged);
        assert_eq!(plan.partition.service(), &CoreSet::from([0]));
    }

    #[test]
    fn breach_takes_idle_cores_first() {
        let p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        let plan = allocate(&p, &[], Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.service(), &CoreSet::from([0, 1]));
        assert_eq!(plan.service, ServiceChange::Grew(1));
    }

    #[test]
    fn breach_reclaims_from_most_recent_job_down_to_floor() {
        let p = two_running();
        let jobs = vec![
            view("a", JobState::Running, 0, Some(1_000)),
            view("b", JobState::Running, 1, Some(2_000)),
        ];

        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.job("b"), CoreSet::from([4]));
        assert_eq!(plan.partition.job("a"), CoreSet::from([1, 2]));

        let plan = allocate(&plan.partition, &jobs, Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.job("b"), CoreSet::from([4]));
        assert_eq!(plan.partition.job("a"), CoreSet::from([2]));
        assert!(plan.pause.is_empty());

        // Everyone at the floor: the most recent job is paused.
        let plan = allocate(&plan.partition, &jobs, Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.pause, vec!["b".to_string()]);
        assert!(plan.partition.job("b").is_empty());
        assert_eq!(plan.partition.service(), &CoreSet::from([0, 1, 3, 4]));
    }

    #[test]
    fn equal_start_times_fall_back_to_tie_break() {
        let p = two_running();
        let jobs = vec![
            view("a", JobState::Running, 0, Some(1_000)),
            view("b", JobState::Running, 1, Some(1_000)),
        ];
        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.job("b").len(), 1);

        let mut p = two_running();
        p.transfer(&CoreSet::from([4]), &Holder::Job("b".into()), &Holder::Idle)
            .unwrap();
        p.transfer(&CoreSet::from([4]), &Holder::Idle, &Holder::Service)
            .unwrap();
        let most = AllocationPolicy {
            tie_break: TieBreak::MostCores,
            ..policy()
        };
        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &most).unwrap();
        assert_eq!(plan.partition.job("a").len(), 1);
    }

    #[test]
    fn no_pause_when_disabled() {
        let mut p = CorePartition::new(CoreSet::range(0, 1), CoreSet::from([0])).unwrap();
        p.transfer(&CoreSet::from([1]), &Holder::Idle, &Holder::Job("a".into()))
            .unwrap();
        let jobs = vec![view("a", JobState::Running, 0, Some(1))];
        let keep = AllocationPolicy {
            pause_on_exhaustion: false,
            ..policy()
        };
        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &keep).unwrap();
        assert!(plan.pause.is_empty());
        assert_eq!(plan.service, ServiceChange::Unchanged);
    }

    #[test]
    fn frozen_jobs_keep_their_cores() {
        let p = two_running();
        let mut jobs = vec![
            view("a", JobState::Running, 0, Some(1_000)),
            view("b", JobState::Running, 1, Some(2_000)),
        ];
        jobs[1].frozen = true;
        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.job("b"), CoreSet::from([3, 4]));
        assert_eq!(plan.partition.job("a"), CoreSet::from([2]));
    }

    #[test]
    fn service_capped_at_max() {
        let p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0, 1])).unwrap();
        let capped = AllocationPolicy {
            service_max: 2,
            ..policy()
        };
        let plan = allocate(&p, &[], Pressure::Breach, false, false, &capped).unwrap();
        assert_eq!(plan.service, ServiceChange::Unchanged);
        assert_eq!(plan.partition.service().len(), 2);
    }

    #[test]
    fn shrink_only_when_due_and_above_minimum() {
        let p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0, 1])).unwrap();
        let plan = allocate(&p, &[], Pressure::Comfortable, false, false, &policy()).unwrap();
        assert_eq!(plan.service, ServiceChange::Unchanged);

        let plan = allocate(&p, &[], Pressure::Comfortable, true, false, &policy()).unwrap();
        assert_eq!(plan.service, ServiceChange::Shrank(1));
        assert_eq!(plan.partition.service(), &CoreSet::from([0]));

        let plan = allocate(&plan.partition, &[], Pressure::Comfortable, true, false, &policy()).unwrap();
        assert_eq!(plan.service, ServiceChange::Unchanged);
    }

    #[test]
    fn idle_cores_go_to_running_then_paused_then_ready() {
        let mut p = CorePartition::new(CoreSet::range(0, 4), CoreSet::from([0])).unwrap();
        p.transfer(&CoreSet::from([1]), &Holder::Idle, &Holder::Job("run".into()))
            .unwrap();
        let jobs = vec![
            view("ready", JobState::Ready, 0, None),
            view("run", JobState::Running, 1, Some(1)),
            view("paused", JobState::Paused, 2, Some(2)),
        ];

        let plan = allocate(&p, &jobs, Pressure::Steady, false, false, &policy()).unwrap();
        assert_eq!(plan.partition.job("run"), CoreSet::from([1, 2]));
        assert_eq!(plan.resume, vec!["paused".to_string()]);
        assert_eq!(plan.partition.job("paused"), CoreSet::from([3, 4]));
        assert!(plan.start.is_empty());
        assert_eq!(plan.partition.job("ready"), CoreSet::new());
    }

    #[test]
    fn ready_job_respects_allowed_cores() {
        let p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        let mut job = view("pinned", JobState::Ready, 0, None);
        job.allowed = CoreSet::from([3]);
        let plan = allocate(&p, &[job], Pressure::Comfortable, false, false, &policy()).unwrap();
        assert_eq!(plan.start, vec!["pinned".to_string()]);
        assert_eq!(plan.partition.job("pinned"), CoreSet::from([3]));
    }

    #[test]
    fn no_job_growth_under_breach() {
        let mut p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0, 1])).unwrap();
        p.transfer(&CoreSet::from([2]), &Holder::Idle, &Holder::Job("a".into()))
            .unwrap();
        let capped = AllocationPolicy {
            service_max: 2,
            ..policy()
        };
        let jobs = vec![
            view("a", JobState::Running, 0, Some(1)),
            view("b", JobState::Ready, 1, None),
        ];
        let plan = allocate(&p, &jobs, Pressure::Breach, false, false, &capped).unwrap();
        assert_eq!(plan.partition.job("a"), CoreSet::from([2]));
        assert!(plan.start.is_empty());
        assert_eq!(plan.partition.idle(), &CoreSet::from([3]));
    }
}
