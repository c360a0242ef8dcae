//! The runtime view a task body gets of its surroundings.
//!
//! A task never touches the store or the orchestrator directly: the engine
//! hands it a [`TaskInvocation`] carrying the validated pipeline params, the
//! pre-resolved values of its declared input bindings, and a [`RunContext`]
//! handle for lazy upstream reads and run-scoped logging.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
  #[error("failed to read upstream output: {0}")]
  Storage(String),

  #[error("missing required input '{0}'")]
  MissingInput(String),
}

/// Severity of a run-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
  Debug,
  Info,
  Warning,
  Error,
}

impl LogLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Warning => "WARNING",
      LogLevel::Error => "ERROR",
    }
  }
}

/// Handle given to a running task instance.
///
/// Reads go through the persistence gateway on demand, so a task only pays
/// for the upstream outputs it actually asks for. The logger is bound to the
/// current pipeline/task/run (and map index for fanned-out instances).
#[async_trait]
pub trait RunContext: Send + Sync {
  /// Fetch the output of an upstream task.
  ///
  /// Returns `None` when the upstream produced no output; this is not an
  /// error, tasks must tolerate absent optional upstream data. For
  /// fanned-out instances the mapping source resolves to the single item at
  /// this instance's index.
  async fn get_output_data(&self, task_id: &str) -> Result<Option<Value>, ContextError>;

  /// Write a record to the per-run log.
  fn log(&self, level: LogLevel, message: &str);

  fn debug(&self, message: &str) {
    self.log(LogLevel::Debug, message);
  }

  fn info(&self, message: &str) {
    self.log(LogLevel::Info, message);
  }

  fn warning(&self, message: &str) {
    self.log(LogLevel::Warning, message);
  }

  fn error(&self, message: &str) {
    self.log(LogLevel::Error, message);
  }
}

/// Everything a task body receives when invoked.
#[derive(Clone)]
pub struct TaskInvocation {
  /// The pipeline's validated input parameters, if any.
  pub params: Option<Value>,
  /// Values of the task's declared input bindings, keyed by binding name.
  /// A `None` value means the upstream produced no output.
  pub inputs: HashMap<String, Option<Value>>,
  /// Resolver and logging handle for this instance.
  pub context: Arc<dyn RunContext>,
}

impl TaskInvocation {
  /// Look up a resolved input binding by name. Absent bindings and bindings
  /// whose upstream produced no output both yield `None`.
  pub fn input(&self, name: &str) -> Option<&Value> {
    self.inputs.get(name).and_then(|v| v.as_ref())
  }

  /// Like [`input`](Self::input) but treats a missing value as an error.
  pub fn require_input(&self, name: &str) -> Result<&Value, ContextError> {
    self
      .input(name)
      .ok_or_else(|| ContextError::MissingInput(name.to_string()))
  }

  pub fn params(&self) -> Option<&Value> {
    self.params.as_ref()
  }

  pub fn context(&self) -> &Arc<dyn RunContext> {
    &self.context
  }
}
