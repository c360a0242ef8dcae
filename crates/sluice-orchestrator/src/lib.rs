//! Sluice Orchestrator
//!
//! The stateful core of sluice: it owns the pipeline/trigger registry,
//! starts runs (scheduled or manual), reacts to every task-instance
//! completion to decide which downstream tasks become ready (including
//! dynamic fan-out expansion and skip propagation), and finalizes run
//! status.
//!
//! # Architecture
//!
//! ```text
//! scheduler job loops ──fire──▶ Orchestrator ──creates──▶ PipelineRun
//!                                   │
//!                         start_pipeline_tasks
//!                                   │ spawn per instance
//!                                   ▼
//!                        execute_task_instance (executor.rs)
//!                                   │ terminal status persisted
//!                                   ▼
//!                         handle_task_completion ─▶ schedule downstream /
//!                                                   expand fan-out /
//!                                                   finish the run
//! ```
//!
//! All run and task state lives in the store; completion handling re-reads
//! it under a per-run mutex, which keeps downstream instantiation
//! exactly-once when sibling instances finish at the same time.

mod error;
mod executor;
mod orchestrator;
mod scheduler;

pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, REASON_API, REASON_SCHEDULED};
