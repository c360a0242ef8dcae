//! Sluice Engine
//!
//! This crate executes single task instances for sluice: it resolves the
//! task's declared input bindings against upstream outputs (applying the
//! fan-out index-selection rules), validates bound values against their
//! schemas, and invokes the task body: asynchronous bodies run on the event
//! loop, synchronous bodies on the blocking pool.
//!
//! It also provides the run observability primitives: [`RunEvent`] /
//! [`RunNotifier`] for status broadcasts and the per-run JSON-lines log
//! sink ([`RunLogStore`]).

mod context;
mod error;
mod events;
mod execute;
mod logs;
mod schema;

pub use context::TaskContext;
pub use error::EngineError;
pub use events::{ChannelNotifier, NoopNotifier, RunEvent, RunNotifier, RunSummary};
pub use execute::execute_task;
pub use logs::{RunLogSink, RunLogStore, RunLogger};
pub use schema::validate_value;
