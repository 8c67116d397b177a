//! Task flow execution runtime
//!
//! This crate provides the graph builder and the concurrent executor: tasks
//! are registered on a [`Flow`], validated, then run with one tokio task per
//! graph task. Each task waits on its dependencies' outputs and broadcasts
//! its own to its dependents and to the final result map.
//!
//! A task is either fail-through (its failure or panic is recorded and
//! nothing else changes) or fail-stop (its failure or panic halts the run:
//! fail-stop tasks that have not started yet are skipped and the run reports
//! [`taskcore::FlowError::Halted`]).

mod executor;
mod registry;
mod runtime;
mod slot;
mod trace;

pub use executor::Execution;
pub use registry::Flow;
pub use runtime::{FlowRuntime, RuntimeConfig};
