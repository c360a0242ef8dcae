use sluice_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("pipeline '{0}' is not registered")]
  UnknownPipeline(String),

  #[error("trigger '{trigger_id}' not found on pipeline '{pipeline_id}'")]
  UnknownTrigger {
    pipeline_id: String,
    trigger_id: String,
  },

  /// A task configured to fan out received a non-list output from its
  /// mapping source. This is a pipeline definition error.
  #[error(
    "task '{task_id}' fans out over '{upstream_id}' but its output is not a list"
  )]
  FanOutSourceNotList {
    task_id: String,
    upstream_id: String,
  },

  /// A chained fan-out task completed from an instance that carries no map
  /// index; chaining is only defined from mapped instances.
  #[error("task '{task_id}' chains from '{upstream_id}' which ran as a non-mapped instance")]
  ChainedFromUnmapped {
    task_id: String,
    upstream_id: String,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}
