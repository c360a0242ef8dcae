//! Sluice Store
//!
//! This crate provides the persistence gateway for sluice: pipeline runs,
//! task run instances and task outputs are created, updated and queried
//! through the [`Store`] trait, backed by SQLite.
//!
//! All cross-instance shared state (run status, task statuses, outputs)
//! lives behind this trait; the orchestrator re-derives state from it on
//! every completion instead of trusting in-memory copies.

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{
  NewPipelineRun, NewTaskRun, PipelineRun, RunStatus, TaskRun, TaskRunOutput, TaskRunUpdate,
};

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Running migrations failed.
  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for pipeline runs, task runs and task outputs.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new pipeline run and return it with its assigned id.
  async fn create_pipeline_run(&self, new_run: NewPipelineRun) -> Result<PipelineRun, StoreError>;

  /// Get a pipeline run by id.
  async fn get_pipeline_run(&self, run_id: i64) -> Result<PipelineRun, StoreError>;

  /// Finish or re-status a pipeline run: sets end time, derives the duration
  /// in milliseconds from the stored start time, and sets the status.
  async fn update_pipeline_run(
    &self,
    run_id: i64,
    end_time: DateTime<Utc>,
    status: RunStatus,
  ) -> Result<PipelineRun, StoreError>;

  /// Mark a pending run as running without touching end time or duration.
  async fn mark_pipeline_run_running(&self, run_id: i64) -> Result<PipelineRun, StoreError>;

  /// Recent runs, newest first, optionally filtered by pipeline and trigger.
  async fn list_pipeline_runs(
    &self,
    pipeline_id: Option<&str>,
    trigger_id: Option<&str>,
  ) -> Result<Vec<PipelineRun>, StoreError>;

  /// The most recent run for a (pipeline, trigger) pair.
  async fn get_latest_pipeline_run(
    &self,
    pipeline_id: &str,
    trigger_id: &str,
  ) -> Result<Option<PipelineRun>, StoreError>;

  /// All runs currently in one of the given statuses.
  async fn list_pipeline_runs_by_status(
    &self,
    statuses: &[RunStatus],
  ) -> Result<Vec<PipelineRun>, StoreError>;

  /// Create a new task run instance.
  async fn create_task_run(&self, new_task_run: NewTaskRun) -> Result<TaskRun, StoreError>;

  /// Get a task run by id.
  async fn get_task_run(&self, task_run_id: &str) -> Result<TaskRun, StoreError>;

  /// Apply a partial update and return the updated row.
  async fn update_task_run(
    &self,
    task_run_id: &str,
    update: TaskRunUpdate,
  ) -> Result<TaskRun, StoreError>;

  /// Task runs of a pipeline run, optionally restricted to the given task
  /// ids and/or statuses. Used for dependency checks and output resolution.
  async fn get_task_runs_for_pipeline_run(
    &self,
    run_id: i64,
    task_ids: Option<&[String]>,
    statuses: Option<&[RunStatus]>,
  ) -> Result<Vec<TaskRun>, StoreError>;

  /// Bulk-insert cancelled task runs for tasks that will never execute
  /// (empty fan-out skip propagation).
  async fn mark_tasks_as_skipped(
    &self,
    task_ids: &BTreeSet<String>,
    run_id: i64,
  ) -> Result<(), StoreError>;

  /// Cancel every pending or running task run of a pipeline run; returns the
  /// number of rows affected. Used by the startup recovery sweep.
  async fn cancel_active_task_runs(&self, run_id: i64) -> Result<u64, StoreError>;

  /// Persist a task output and link it to its task run.
  async fn create_task_run_output(
    &self,
    task_run_id: &str,
    data: Value,
    mimetype: &str,
    encoding: &str,
  ) -> Result<TaskRunOutput, StoreError>;

  /// Get a task output by id.
  async fn get_task_run_output_by_id(
    &self,
    output_id: &str,
  ) -> Result<Option<TaskRunOutput>, StoreError>;
}
