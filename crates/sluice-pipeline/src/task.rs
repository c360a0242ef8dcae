use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TaskInvocation;
use crate::util::prettify_name;

/// How a task handles list output from its mapping source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
  /// One task instance per element of the upstream's list output.
  FanOut,
  /// One task instance per upstream *instance*, inheriting its map index.
  ChainedFanOut,
}

/// What a task body returns: `None` means "no output produced" and no output
/// record is stored. Any `Some` value, falsy or not, is persisted.
pub type TaskOutput = Option<Value>;

/// Error type task bodies may fail with.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type SyncTaskFn = dyn Fn(TaskInvocation) -> Result<TaskOutput, TaskError> + Send + Sync;
type AsyncTaskFn =
  dyn Fn(TaskInvocation) -> BoxFuture<'static, Result<TaskOutput, TaskError>> + Send + Sync;

/// The callable wrapped by a task.
///
/// Synchronous bodies are run off the event loop by the engine so a blocking
/// task cannot stall concurrently executing instances; asynchronous bodies
/// are awaited in place.
#[derive(Clone)]
pub enum TaskFn {
  Sync(Arc<SyncTaskFn>),
  Async(Arc<AsyncTaskFn>),
}

impl TaskFn {
  pub fn from_sync<F>(f: F) -> Self
  where
    F: Fn(TaskInvocation) -> Result<TaskOutput, TaskError> + Send + Sync + 'static,
  {
    TaskFn::Sync(Arc::new(f))
  }

  pub fn from_async<F, Fut>(f: F) -> Self
  where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
  {
    TaskFn::Async(Arc::new(move |invocation| Box::pin(f(invocation))))
  }
}

impl fmt::Debug for TaskFn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskFn::Sync(_) => f.write_str("TaskFn::Sync"),
      TaskFn::Async(_) => f.write_str("TaskFn::Async"),
    }
  }
}

/// A named input binding: before invoking the task, the engine resolves the
/// output of `upstream_id` and passes it under `name`. When a schema is
/// attached the resolved value is validated against it first; a value that
/// does not conform fails the task instance.
#[derive(Debug, Clone)]
pub struct Binding {
  pub name: String,
  pub upstream_id: String,
  pub schema: Option<Value>,
}

impl Binding {
  pub fn new(name: impl Into<String>, upstream_id: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      upstream_id: upstream_id.into(),
      schema: None,
    }
  }

  pub fn with_schema(mut self, schema: Value) -> Self {
    self.schema = Some(schema);
    self
  }
}

/// A named unit of work within a pipeline.
///
/// Tasks are assembled through a [`PipelineBuilder`](crate::PipelineBuilder),
/// which wires the upstream/downstream id sets; once the pipeline is built
/// the task is immutable.
#[derive(Debug, Clone)]
pub struct Task {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub run: TaskFn,
  pub upstream_task_ids: BTreeSet<String>,
  pub downstream_task_ids: BTreeSet<String>,
  pub mapping_mode: Option<MappingMode>,
  pub map_upstream_id: Option<String>,
  pub bindings: Vec<Binding>,
}

impl Task {
  pub fn new(id: impl Into<String>, run: TaskFn) -> Self {
    let id = id.into();
    let name = prettify_name(&id);
    Self {
      id,
      name,
      description: None,
      run,
      upstream_task_ids: BTreeSet::new(),
      downstream_task_ids: BTreeSet::new(),
      mapping_mode: None,
      map_upstream_id: None,
      bindings: Vec::new(),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn with_binding(mut self, binding: Binding) -> Self {
    self.bindings.push(binding);
    self
  }

  /// Fan out over the list output of `upstream_id`: one instance per element.
  pub fn fan_out(mut self, upstream_id: impl Into<String>) -> Self {
    self.mapping_mode = Some(MappingMode::FanOut);
    self.map_upstream_id = Some(upstream_id.into());
    self
  }

  /// Continue a fan-out one item at a time, inheriting the map index of each
  /// instance of `upstream_id`.
  pub fn chained_fan_out(mut self, upstream_id: impl Into<String>) -> Self {
    self.mapping_mode = Some(MappingMode::ChainedFanOut);
    self.map_upstream_id = Some(upstream_id.into());
    self
  }
}
