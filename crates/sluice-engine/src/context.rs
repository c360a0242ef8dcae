//! Dependency resolution for one task instance.
//!
//! A [`TaskContext`] is built per task run from freshly loaded upstream task
//! run metadata; output payloads are only fetched from the store when a task
//! actually reads them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sluice_pipeline::{ContextError, LogLevel, MappingMode, RunContext, Task};
use sluice_store::{Store, TaskRun};

use crate::error::EngineError;
use crate::logs::RunLogger;

/// Qualified lookup key for an upstream instance: mapped instances are keyed
/// `"{task_id}.{map_index}"`, plain instances by task id alone.
fn upstream_key(task_run: &TaskRun) -> String {
  match task_run.map_index {
    Some(index) => format!("{}.{}", task_run.task_id, index),
    None => task_run.task_id.clone(),
  }
}

/// Per-instance view of upstream outputs, plus the run-scoped logger.
pub struct TaskContext {
  store: Arc<dyn Store>,
  upstream: HashMap<String, TaskRun>,
  /// The current instance's own mapping role, if it is a fan-out child.
  mapping: Option<(MappingMode, i64)>,
  map_upstream_id: Option<String>,
  logger: RunLogger,
}

impl TaskContext {
  /// Load upstream task run metadata for `task_run` and build its context.
  pub async fn load(
    store: Arc<dyn Store>,
    task: &Task,
    task_run: &TaskRun,
    logger: RunLogger,
  ) -> Result<Self, EngineError> {
    let upstream_ids: Vec<String> = task.upstream_task_ids.iter().cloned().collect();
    let runs = if upstream_ids.is_empty() {
      Vec::new()
    } else {
      store
        .get_task_runs_for_pipeline_run(task_run.pipeline_run_id, Some(&upstream_ids), None)
        .await?
    };

    let upstream = runs
      .into_iter()
      .map(|run| (upstream_key(&run), run))
      .collect();

    let mapping = match (task.mapping_mode, task_run.map_index) {
      (Some(mode), Some(index)) => Some((mode, index)),
      _ => None,
    };

    Ok(Self {
      store,
      upstream,
      mapping,
      map_upstream_id: task.map_upstream_id.clone(),
      logger,
    })
  }

  fn is_map_source(&self, task_id: &str) -> bool {
    self.map_upstream_id.as_deref() == Some(task_id)
  }

  async fn read_output(&self, task_run: &TaskRun) -> Result<Option<Value>, EngineError> {
    let Some(output_id) = &task_run.task_output_id else {
      return Ok(None);
    };
    let output = self.store.get_task_run_output_by_id(output_id).await?;
    Ok(output.map(|output| output.data.0))
  }

  /// Resolve an upstream task's output for this instance.
  ///
  /// A fan-out child reading its mapping source gets the single list item at
  /// its own index; a chained child inherits the index to address the right
  /// upstream instance; everything else is a plain lookup of the full output.
  pub async fn resolve(&self, task_id: &str) -> Result<Option<Value>, EngineError> {
    match self.mapping {
      Some((MappingMode::FanOut, index)) if self.is_map_source(task_id) => {
        let Some(run) = self.upstream.get(task_id) else {
          return Ok(None);
        };
        let Some(data) = self.read_output(run).await? else {
          return Ok(None);
        };
        Ok(data.get(index as usize).cloned())
      }
      Some((MappingMode::ChainedFanOut, index)) if self.is_map_source(task_id) => {
        let key = format!("{task_id}.{index}");
        match self.upstream.get(&key) {
          Some(run) => self.read_output(run).await,
          None => Ok(None),
        }
      }
      _ => match self.upstream.get(task_id) {
        Some(run) => self.read_output(run).await,
        None => Ok(None),
      },
    }
  }

  pub fn logger(&self) -> &RunLogger {
    &self.logger
  }
}

#[async_trait]
impl RunContext for TaskContext {
  async fn get_output_data(&self, task_id: &str) -> Result<Option<Value>, ContextError> {
    self
      .resolve(task_id)
      .await
      .map_err(|err| ContextError::Storage(err.to_string()))
  }

  fn log(&self, level: LogLevel, message: &str) {
    self.logger.log(level, message);
  }
}
