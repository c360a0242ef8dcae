use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("pipeline '{pipeline_id}': duplicate task id '{task_id}'")]
  DuplicateTask { pipeline_id: String, task_id: String },

  #[error(
    "pipeline '{pipeline_id}': task '{task_id}' depends on unknown task '{upstream_id}'"
  )]
  UnknownDependency {
    pipeline_id: String,
    task_id: String,
    upstream_id: String,
  },

  #[error("pipeline '{pipeline_id}': dependency declaration names unknown task '{task_id}'")]
  UnknownTask {
    pipeline_id: String,
    task_id: String,
  },

  #[error("pipeline '{pipeline_id}' contains a dependency cycle")]
  CycleDetected { pipeline_id: String },

  #[error("task '{task_id}' declares a mapping mode but no map upstream")]
  MappingWithoutSource { task_id: String },

  #[error("task '{task_id}': map upstream '{upstream_id}' is not an upstream dependency")]
  MapSourceNotUpstream {
    task_id: String,
    upstream_id: String,
  },

  #[error(
    "task '{task_id}': input binding '{name}' reads from '{upstream_id}' which is not an upstream dependency"
  )]
  BindingNotUpstream {
    task_id: String,
    name: String,
    upstream_id: String,
  },
}
