use sluice_pipeline::TaskError;
use sluice_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  /// The task body returned an error.
  #[error("task '{task_id}' failed: {source}")]
  TaskFailed {
    task_id: String,
    #[source]
    source: TaskError,
  },

  /// A synchronous task body could not be joined from the blocking pool.
  #[error("task '{task_id}' aborted: {message}")]
  Aborted { task_id: String, message: String },

  /// A resolved input binding did not conform to its declared schema.
  #[error("task '{task_id}': input '{name}' failed validation: {details}")]
  InputValidation {
    task_id: String,
    name: String,
    details: String,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}
