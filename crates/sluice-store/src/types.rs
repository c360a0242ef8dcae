use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// Lifecycle status shared by pipeline runs and task runs.
///
/// `Pending` is the initial state of a task run only; a pipeline run starts
/// out `Running` (scheduled) or `Pending` (manual, before pickup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl RunStatus {
  /// Statuses that still hold an executor's attention.
  pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

  /// Terminal statuses.
  pub const FINISHED: [RunStatus; 3] = [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled];

  pub fn is_finished(&self) -> bool {
    Self::FINISHED.contains(self)
  }

  pub fn is_active(&self) -> bool {
    Self::ACTIVE.contains(self)
  }
}

/// One execution instance of a pipeline, as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PipelineRun {
  pub id: i64,
  pub pipeline_id: String,
  pub trigger_id: String,
  pub status: RunStatus,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  /// Milliseconds between start and end, zero while the run is active.
  pub duration: i64,
  /// Snapshot of the resolved input parameters.
  pub input_params: Option<Json<Value>>,
  /// Why the run was started, e.g. "scheduled" or "api".
  pub reason: String,
}

impl PipelineRun {
  pub fn input_params_value(&self) -> Option<Value> {
    self.input_params.as_ref().map(|params| params.0.clone())
  }
}

/// One execution instance of a task within a pipeline run; the unit that may
/// be multiplied by fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskRun {
  /// Time-ordered UUID, globally unique.
  pub id: String,
  pub pipeline_run_id: i64,
  pub task_id: String,
  pub status: RunStatus,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  /// Milliseconds, set on the terminal transition.
  pub duration: Option<i64>,
  /// Resolved input snapshot; carries the pipeline params under `"params"`.
  pub context: Json<Value>,
  pub task_output_id: Option<String>,
  /// Non-null exactly when this instance is one item of a fan-out.
  pub map_index: Option<i64>,
  /// For fan-out and chained-fan-out children: the instance whose completion
  /// produced this one.
  pub parent_task_run_id: Option<String>,
}

/// The captured return value of a successful task execution. Owned 1:1 by
/// its task run, never mutated, referenced (not copied) downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskRunOutput {
  pub id: String,
  pub mimetype: String,
  pub encoding: String,
  /// Serialized payload size in bytes.
  pub size: i64,
  pub data: Json<Value>,
}

/// Fields needed to create a pipeline run.
#[derive(Debug, Clone)]
pub struct NewPipelineRun {
  pub pipeline_id: String,
  pub trigger_id: String,
  pub status: RunStatus,
  pub input_params: Option<Value>,
  pub reason: String,
  pub start_time: DateTime<Utc>,
}

/// Fields needed to create a task run.
#[derive(Debug, Clone)]
pub struct NewTaskRun {
  pub pipeline_run_id: i64,
  pub task_id: String,
  pub status: RunStatus,
  pub context: Value,
  pub parent_task_run_id: Option<String>,
  pub map_index: Option<i64>,
  pub start_time: DateTime<Utc>,
}

/// Partial update applied to a task run. `status` is always written; the
/// remaining fields keep their stored value when `None`.
#[derive(Debug, Clone, Default)]
pub struct TaskRunUpdate {
  pub status: Option<RunStatus>,
  pub end_time: Option<DateTime<Utc>>,
  pub duration: Option<i64>,
  pub task_output_id: Option<String>,
}

impl TaskRunUpdate {
  pub fn status(status: RunStatus) -> Self {
    Self {
      status: Some(status),
      ..Self::default()
    }
  }
}
