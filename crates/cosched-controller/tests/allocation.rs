mod common;

use cosched_controller::{Action, Pressure};
use cosched_core::{ErrorKind, JobState, UnitId};
use cosched_executor::MockCall;

use common::{BAD, GOOD, Harness, OK, config_toml, cores};

const THREE_JOBS: &str = r#"
[[jobs]]
name = "a"
threads = 2
command = ["run"]

[[jobs]]
name = "b"
threads = 2
depends_on = ["a"]
command = ["run"]

[[jobs]]
name = "c"
threads = 1
command = ["run"]
"#;

#[tokio::test(start_paused = true)]
async fn partition_covers_the_inventory_every_tick() {
    let toml = config_toml("0-3", r#"initial_cores = "0""#, "hysteresis_ticks = 3", THREE_JOBS);
    let mut h = Harness::new(&toml).await;

    // Every tick re-checks the exact cover and the runtime's affinity.
    h.tick_with(GOOD).await;
    assert_eq!(h.job_cores("a"), cores("1,2"));
    assert_eq!(h.job_cores("c"), cores("3"));

    h.tick_with(BAD).await;
    assert_eq!(h.service(), cores("0,1"));

    h.mock.finish(&UnitId::job("a"), 0);
    h.tick_with(OK).await;
    assert_eq!(h.ctl.job_state("a"), Some(JobState::Completed));
    assert_eq!(h.job_cores("b"), cores("2"));

    h.tick_with(BAD).await;
    assert_eq!(h.ctl.job_state("b"), Some(JobState::Paused));

    for _ in 0..4 {
        h.tick_with(GOOD).await;
    }
    assert_eq!(h.ctl.job_state("b"), Some(JobState::Running));
}

#[tokio::test(start_paused = true)]
async fn service_never_shrinks_under_breach() {
    let jobs = r#"
[[jobs]]
name = "a"
threads = 2
command = ["run"]

[[jobs]]
name = "b"
threads = 2
command = ["run"]

[[jobs]]
name = "c"
threads = 2
command = ["run"]
"#;
    let toml = config_toml("0-5", r#"initial_cores = "0""#, "", jobs);
    let mut h = Harness::new(&toml).await;

    h.tick_with(OK).await;
    assert_eq!(h.ctl.partition().jobs().len(), 3);

    let mut before = h.service().len();
    for _ in 0..5 {
        let report = h.tick_with(BAD).await;
        assert_eq!(report.pressure, Pressure::Breach);
        let after = h.service().len();
        assert!(after >= before, "service shrank from {before} to {after} under breach");
        before = after;
    }

    // Reclaiming down to the floor, then pausing, gives the service everything.
    assert_eq!(h.service(), cores("0-5"));
    for job in ["a", "b", "c"] {
        assert_eq!(h.ctl.job_state(job), Some(JobState::Paused));
    }

    // Paused jobs are not paused again.
    h.tick_with(BAD).await;
    let pauses = h
        .mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::Pause(UnitId::Job(j)) if j == "a"))
        .count();
    assert_eq!(pauses, 1);
}

#[tokio::test(start_paused = true)]
async fn shrink_waits_for_consecutive_comfortable_ticks() {
    let jobs = r#"
[[jobs]]
name = "x"
threads = 1
command = ["run"]
"#;
    let toml = config_toml("0-3", r#"initial_cores = "0,1""#, "hysteresis_ticks = 3", jobs);
    let mut h = Harness::new(&toml).await;

    h.tick_with(BAD).await;
    assert_eq!(h.service(), cores("0-2"));

    // One good sample after a breach is not enough.
    h.tick_with(GOOD).await;
    assert_eq!(h.service().len(), 3);
    assert_eq!(h.job_cores("x"), cores("3"));

    h.tick_with(GOOD).await;
    assert_eq!(h.service().len(), 3);

    h.tick_with(GOOD).await;
    assert_eq!(h.service(), cores("0,1"));

    // The streak starts over after a shrink.
    h.tick_with(GOOD).await;
    assert_eq!(h.service(), cores("0,1"));

    // A breach in the middle of a streak resets it too.
    h.telemetry.push(&[GOOD, BAD, GOOD, GOOD]);
    for _ in 0..4 {
        h.tick().await;
    }
    assert_eq!(h.service(), cores("0-2"));
    let shrinks = h
        .events
        .actions()
        .into_iter()
        .filter(|a| matches!(a, Action::ServiceShrank { .. }))
        .count();
    assert_eq!(shrinks, 1);
}

#[tokio::test(start_paused = true)]
async fn most_recently_started_job_loses_cores_first() {
    // Name order alone would pick "z-early" first.
    let jobs = r#"
[[jobs]]
name = "z-early"
threads = 2
cores = "1,2"
command = ["run"]

[[jobs]]
name = "a-late"
threads = 2
cores = "3,4"
command = ["run"]
"#;
    let toml = config_toml(
        "0-4",
        "initial_cores = \"0,3,4\"\nmin_cores = 1",
        "hysteresis_ticks = 1\nshrink_step = 2",
        jobs,
    );
    let mut h = Harness::new(&toml).await;

    h.tick_with(OK).await;
    assert_eq!(h.job_cores("z-early"), cores("1,2"));
    assert_eq!(h.ctl.job_state("a-late"), Some(JobState::Ready));

    h.tick_with(GOOD).await;
    assert_eq!(h.service(), cores("0"));
    assert_eq!(h.job_cores("a-late"), cores("3,4"));

    h.tick_with(BAD).await;
    assert_eq!(h.job_cores("a-late"), cores("4"));
    assert_eq!(h.job_cores("z-early"), cores("1,2"));

    h.tick_with(BAD).await;
    assert_eq!(h.job_cores("a-late"), cores("4"));
    assert_eq!(h.job_cores("z-early"), cores("2"));

    h.tick_with(BAD).await;
    assert_eq!(h.ctl.job_state("a-late"), Some(JobState::Paused));
    assert_eq!(h.ctl.job_state("z-early"), Some(JobState::Running));
    assert_eq!(h.service(), cores("0,1,3,4"));
    assert!(h.mock.is_paused(&UnitId::job("a-late")));
}

#[tokio::test(start_paused = true)]
async fn missing_service_stats_count_as_breach() {
    let jobs = r#"
[[jobs]]
name = "x"
threads = 1
command = ["run"]
"#;
    let toml = config_toml("0-3", r#"initial_cores = "0,1""#, "hysteresis_ticks = 1", jobs);
    let mut h = Harness::new(&toml).await;

    // Nothing scripted: the service is unreadable.
    let report = h.tick().await;
    assert_eq!(report.pressure, Pressure::Breach);
    assert_eq!(h.service().len(), 3);
    assert!(h.events.error_kinds().contains(&ErrorKind::TelemetryUnavailable));

    let report = h.tick().await;
    assert_eq!(report.pressure, Pressure::Breach);
    assert_eq!(h.service().len(), 4);
}

const ONE_JOB: &str = r#"
[[jobs]]
name = "x"
threads = 2
command = ["run"]
"#;

#[tokio::test(start_paused = true)]
async fn service_recovers_after_a_reassignment_timeout() {
    let toml = config_toml("0-3", r#"initial_cores = "0""#, "", ONE_JOB);
    let mut h = Harness::new(&toml).await;

    h.tick_with(OK).await;
    assert_eq!(h.job_cores("x"), cores("1,2"));

    h.mock.hang_affinity(UnitId::Service);
    h.tick_with(BAD).await;
    assert_eq!(h.service(), cores("0"));
    assert!(h.ctl.executor().is_unresponsive(&UnitId::Service));
    assert!(h.events.error_kinds().contains(&ErrorKind::ReassignTimeout));

    // The next tick's status probe is the contact that lifts the exclusion.
    h.mock.unhang(&UnitId::Service);
    h.tick_with(BAD).await;
    assert!(!h.ctl.executor().is_unresponsive(&UnitId::Service));
    assert_eq!(h.service(), cores("0,3"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_service_freezes_allocation_under_breach() {
    let toml = config_toml("0-2", r#"initial_cores = "0""#, "", ONE_JOB);
    let mut h = Harness::new(&toml).await;

    h.tick_with(OK).await;
    assert_eq!(h.job_cores("x"), cores("1,2"));

    h.mock.hang_affinity(UnitId::Service);
    h.mock.hang_status(UnitId::Service);
    for _ in 0..2 {
        let report = h.tick_with(BAD).await;
        assert_eq!(report.pressure, Pressure::Breach);
        // No cores are taken from the job for a service that cannot use them.
        assert_eq!(h.service(), cores("0"));
        assert_eq!(h.job_cores("x"), cores("1,2"));
        assert!(h.ctl.partition().idle().is_empty());
        assert_eq!(h.ctl.job_state("x"), Some(JobState::Running));
    }
    assert!(!h.mock.calls().iter().any(|c| matches!(
        c,
        MockCall::SetAffinity { unit: UnitId::Job(_), .. } | MockCall::Pause(_)
    )));

    h.mock.unhang(&UnitId::Service);
    h.tick_with(BAD).await;
    assert_eq!(h.service(), cores("0,1"));
    assert_eq!(h.job_cores("x"), cores("2"));
}
