//! cosched-telemetry — read-only view of the host and the service.
//!
//! Each control tick takes one [`TelemetrySample`]:
//!
//! ```text
//! SystemSampler::sample(pids)
//!   ├── HostReader (procfs)   → per-core utilization, per-pid CPU/RSS, meminfo
//!   └── StatsReader (tcp)     → `stats` over the memcached text protocol
//!                               → latency stat, ops/sec
//! ```
//!
//! Both halves run concurrently. The stats query has its own timeout and
//! degrades to [`ServiceStats::Unavailable`]; the whole sample is bounded by
//! a budget, past which it is abandoned and the caller keeps its last good
//! reading.

pub mod error;
pub mod procfs;
pub mod sample;
pub mod sampler;
pub mod stats;

pub use error::{TelemetryError, TelemetryResult};
pub use procfs::{HostReader, find_pid_by_name, online_cores};
pub use sample::{MemoryUsage, ProcessUsage, ServiceReading, ServiceStats, TelemetrySample};
pub use sampler::{SystemSampler, TelemetrySource};
pub use stats::{StatsReader, parse_stats, query_stats};
