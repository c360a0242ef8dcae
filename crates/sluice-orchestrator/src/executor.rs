//! Task instance execution wrapper.
//!
//! Drives one task run through PENDING → RUNNING → COMPLETED/FAILED,
//! persists the output, and hands the terminal instance back to
//! [`Orchestrator::handle_task_completion`] exactly once. Every failure mode
//! (body error, input validation, output persistence) lands here as a FAILED
//! instance; nothing escapes to crash the process.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use sluice_engine::{TaskContext, execute_task, validate_value};
use sluice_pipeline::{Pipeline, Task};
use sluice_store::{RunStatus, TaskRun, TaskRunUpdate};
use tracing::{error, warn};

use crate::orchestrator::Orchestrator;

/// Boxed so the spawn inside scheduling and the completion re-entry don't
/// form an infinitely recursive future type.
pub(crate) fn execute_task_instance(
  orchestrator: Arc<Orchestrator>,
  pipeline: Arc<Pipeline>,
  task: Task,
  task_run: TaskRun,
) -> BoxFuture<'static, ()> {
  run_instance(orchestrator, pipeline, task, task_run).boxed()
}

async fn run_instance(
  orchestrator: Arc<Orchestrator>,
  pipeline: Arc<Pipeline>,
  task: Task,
  task_run: TaskRun,
) {
  let run_id = task_run.pipeline_run_id;
  let logger = orchestrator
    .run_logger(&pipeline.id, run_id)
    .for_task(&task.id, task_run.map_index);

  let started = Utc::now();
  let task_run = match orchestrator
    .store()
    .update_task_run(&task_run.id, TaskRunUpdate::status(RunStatus::Running))
    .await
  {
    Ok(task_run) => task_run,
    Err(err) => {
      error!(run_id, task_id = %task.id, error = %err, "failed to mark task run running");
      return;
    }
  };
  emit_update(&orchestrator, run_id).await;
  logger.info(&format!("executing task '{}'", task.id));

  let mut failure: Option<String> = None;
  let mut output_id: Option<String> = None;

  // The pipeline params travel in the task run's stored context; validate
  // them against the pipeline's schema before the body sees them.
  let params = task_run
    .context
    .0
    .get("params")
    .cloned()
    .filter(|value| !value.is_null());
  let params = match (&pipeline.params_schema, params) {
    (Some(schema), Some(value)) => match validate_value(schema, &value) {
      Ok(()) => Some(value),
      Err(details) => {
        failure = Some(format!("input parameters failed validation: {details}"));
        None
      }
    },
    (_, params) => params,
  };

  if failure.is_none() {
    let context = TaskContext::load(
      orchestrator.store().clone(),
      &task,
      &task_run,
      logger.clone(),
    )
    .await;

    match context {
      Ok(context) => match execute_task(&task, Arc::new(context), params).await {
        Ok(Some(output)) => {
          let stored = orchestrator
            .store()
            .create_task_run_output(&task_run.id, output, "application/json", "utf-8")
            .await;
          match stored {
            Ok(output_record) => output_id = Some(output_record.id),
            Err(err) => failure = Some(format!("failed to store task output: {err}")),
          }
        }
        Ok(None) => {}
        Err(err) => failure = Some(err.to_string()),
      },
      Err(err) => failure = Some(format!("failed to build task context: {err}")),
    }
  }

  let status = if failure.is_some() {
    RunStatus::Failed
  } else {
    RunStatus::Completed
  };
  if let Some(message) = &failure {
    logger.error(message);
    warn!(run_id, task_id = %task.id, error = %message, "task instance failed");
  } else {
    logger.info(&format!("task '{}' completed", task.id));
  }

  let end_time = Utc::now();
  let update = TaskRunUpdate {
    status: Some(status),
    end_time: Some(end_time),
    duration: Some((end_time - started).num_milliseconds().max(0)),
    task_output_id: output_id,
  };
  let task_run = match orchestrator.store().update_task_run(&task_run.id, update).await {
    Ok(task_run) => task_run,
    Err(err) => {
      error!(run_id, task_id = %task.id, error = %err, "failed to persist task run result");
      return;
    }
  };
  emit_update(&orchestrator, run_id).await;

  if let Err(err) = orchestrator.handle_task_completion(&task_run).await {
    error!(run_id, task_id = %task_run.task_id, error = %err, "completion handling failed");
  }
}

async fn emit_update(orchestrator: &Arc<Orchestrator>, run_id: i64) {
  match orchestrator.store().get_pipeline_run(run_id).await {
    Ok(run) => orchestrator.emit_run_update(&run),
    Err(err) => warn!(run_id, error = %err, "failed to load run for update broadcast"),
  }
}
