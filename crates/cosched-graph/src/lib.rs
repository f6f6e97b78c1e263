//! cosched-graph — the batch job dependency graph.
//!
//! Holds the job set as a DAG (job → prerequisites) and answers "which jobs
//! may start now". The control loop reports completions and failures back;
//! failures block every downstream job permanently.
//!
//! # Admissibility
//!
//! ```text
//! admissible(j) ⇔ state(j) = Pending ∧ ∀ p ∈ prereqs(j): state(p) = Completed
//! blocked(j)    ⇔ ∃ transitive prerequisite p: state(p) = Failed
//! ```

pub mod error;
pub mod graph;

pub use error::{GraphError, GraphResult};
pub use graph::{BlockedJob, DependencyGraph};
