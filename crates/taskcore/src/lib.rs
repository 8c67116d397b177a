//! Core abstractions for the task flow executor
//!
//! This crate provides the types shared by the runtime and its callers:
//! task bodies, their context and inputs, outcomes and records, errors,
//! and execution events. It does not run anything itself.

mod error;
pub mod events;
mod task;
mod value;

pub use error::{FlowError, GraphError, TaskError};
pub use events::*;
pub use task::{
    TaskContext, TaskFn, TaskInputs, TaskOutcome, TaskRecord, TaskState, NORMAL_STATUS_CODE,
    PANIC_STATUS_CODE,
};
pub use value::Value;
