//! cosched-controller — the scheduling control loop.
//!
//! Keeps a latency-critical service inside its SLO while batch jobs use the
//! rest of the machine. Each tick:
//!
//! ```text
//! Observe   TelemetrySource::sample ─▶ SloTracker ─▶ Breach | Steady | Comfortable
//! Reap      executor.status(job)    ─▶ Completed / Failed ─▶ DependencyGraph
//! Admit     graph.admissible_jobs() ─▶ Ready
//! Allocate  allocate(partition, jobs, pressure) ─▶ AllocationPlan (pure)
//! Act       pause ▸ shrink jobs ▸ reassign service ▸ grow jobs ▸ resume ▸ start
//! Record    EventSink ◀─ Snapshot + actions
//! ```
//!
//! On shutdown the loop drains: every job is stopped with a grace period,
//! stragglers are killed, and all job cores return to idle.

pub mod allocator;
pub mod controller;
pub mod error;
pub mod event;
pub mod slo;
pub mod snapshot;

pub use allocator::{AllocationPlan, AllocationPolicy, JobView, ServiceChange, allocate};
pub use controller::{Controller, TickReport};
pub use error::{ControllerError, ControllerResult};
pub use event::{Action, Event, EventRecord, EventSink, JsonLinesLog, MemorySink, TracingSink};
pub use slo::{Pressure, SloReading, SloTracker, SloVerdict};
pub use snapshot::{JobOutcome, JobSummary, JobTiming, RunSummary, Snapshot};
