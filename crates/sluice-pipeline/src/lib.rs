//! Sluice Pipeline
//!
//! This crate provides the pipeline and task model for sluice: tasks with
//! declared dependencies and input bindings, triggers, and the validated
//! DAG they form.
//!
//! A pipeline is assembled through [`PipelineBuilder`]; construction runs
//! the DAG validation (dangling references, cycles, mapping invariants) so
//! an invalid pipeline can never reach the orchestrator.

mod context;
mod error;
mod graph;
mod pipeline;
mod task;
mod trigger;
mod util;

pub use context::{ContextError, LogLevel, RunContext, TaskInvocation};
pub use error::PipelineError;
pub use graph::{downstream_map, transitive_downstream};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use task::{Binding, MappingMode, Task, TaskError, TaskFn, TaskOutput};
pub use trigger::{MANUAL_TRIGGER_ID, Schedule, Trigger};
pub use util::{job_id, prettify_name};
