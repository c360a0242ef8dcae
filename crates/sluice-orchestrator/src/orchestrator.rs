//! The stateful core: pipeline registry, run lifecycle and the completion
//! protocol that drives dynamic DAG expansion.
//!
//! Only the pipeline/trigger registry lives in memory (append-only after
//! registration); all run and task state is re-derived from the store on
//! every completion, so completion handling is safe to run concurrently for
//! sibling instances. The "check readiness and schedule" step is serialized
//! per pipeline run through an async mutex, which is what makes downstream
//! instantiation exactly-once under racing sibling completions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use sluice_engine::{
  NoopNotifier, RunEvent, RunLogSink, RunLogStore, RunLogger, RunNotifier, RunSummary,
};
use sluice_pipeline::{MANUAL_TRIGGER_ID, MappingMode, Pipeline, Task, Trigger, job_id};
use sluice_store::{NewPipelineRun, NewTaskRun, PipelineRun, RunStatus, Store, TaskRun};
use tokio::sync::Mutex as RunMutex;
use tracing::{error, info, warn};

use crate::error::OrchestratorError;
use crate::executor;
use crate::scheduler::ScheduledJob;

pub const REASON_SCHEDULED: &str = "scheduled";
pub const REASON_API: &str = "api";

/// Configuration for the orchestrator.
pub struct OrchestratorConfig {
  /// Base directory for per-run data (log files).
  pub data_dir: PathBuf,
}

/// The orchestrating core. One instance per process, shared by the scheduler
/// and whatever API layer drives manual runs.
pub struct Orchestrator {
  store: Arc<dyn Store>,
  notifier: Arc<dyn RunNotifier>,
  logs: RunLogStore,
  pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
  jobs: Mutex<Vec<ScheduledJob>>,
  run_locks: Mutex<HashMap<i64, Arc<RunMutex<()>>>>,
  sinks: Mutex<HashMap<i64, Arc<RunLogSink>>>,
}

impl Orchestrator {
  /// Create an orchestrator that discards run events.
  pub fn new(store: Arc<dyn Store>, config: OrchestratorConfig) -> Self {
    Self::with_notifier(store, config, Arc::new(NoopNotifier))
  }

  /// Create an orchestrator with a custom run-event notifier.
  pub fn with_notifier(
    store: Arc<dyn Store>,
    config: OrchestratorConfig,
    notifier: Arc<dyn RunNotifier>,
  ) -> Self {
    Self {
      store,
      notifier,
      logs: RunLogStore::new(config.data_dir),
      pipelines: RwLock::new(HashMap::new()),
      jobs: Mutex::new(Vec::new()),
      run_locks: Mutex::new(HashMap::new()),
      sinks: Mutex::new(HashMap::new()),
    }
  }

  /// Register a validated pipeline and queue scheduler jobs for its active
  /// triggers. Re-registering the same id is a warning no-op.
  pub fn register_pipeline(&self, pipeline: Pipeline) {
    let mut pipelines = self.pipelines.write();
    if pipelines.contains_key(&pipeline.id) {
      warn!(pipeline_id = %pipeline.id, "pipeline already registered");
      return;
    }

    let pipeline = Arc::new(pipeline);
    let mut jobs = self.jobs.lock();
    for trigger in &pipeline.triggers {
      if trigger.paused {
        continue;
      }
      let job_id = job_id(&pipeline.id, &trigger.id);
      if jobs.iter().any(|job| job.job_id == job_id) {
        warn!(%job_id, "job already added");
        continue;
      }
      jobs.push(ScheduledJob {
        job_id,
        pipeline_id: pipeline.id.clone(),
        trigger_id: trigger.id.clone(),
      });
    }

    info!(pipeline_id = %pipeline.id, tasks = pipeline.tasks.len(), "pipeline registered");
    pipelines.insert(pipeline.id.clone(), pipeline);
  }

  pub fn get_pipeline(&self, pipeline_id: &str) -> Option<Arc<Pipeline>> {
    self.pipelines.read().get(pipeline_id).cloned()
  }

  pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
    self.pipelines.read().values().cloned().collect()
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn run_logs(&self) -> &RunLogStore {
    &self.logs
  }

  pub(crate) fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
    self.jobs.lock().clone()
  }

  /// Sweep runs abandoned by a previous process lifetime, then start the
  /// trigger jobs. The sweep is a correctness requirement: no executor can
  /// still be driving those runs.
  pub async fn start(
    self: &Arc<Self>,
    cancel: tokio_util::sync::CancellationToken,
  ) -> Result<(), OrchestratorError> {
    self.recover_stuck_runs().await?;
    crate::scheduler::spawn_jobs(self.clone(), &cancel);
    Ok(())
  }

  /// Cancel every run left running (or pending from a manual submission) by
  /// a previous process, together with its active task runs. Returns the
  /// number of runs swept.
  pub async fn recover_stuck_runs(&self) -> Result<usize, OrchestratorError> {
    let stuck = self.store.list_pipeline_runs_by_status(&RunStatus::ACTIVE).await?;
    let mut recovered = 0;

    for run in stuck {
      let abandoned = run.status == RunStatus::Running
        || (run.status == RunStatus::Pending
          && (run.reason == REASON_API || run.trigger_id == MANUAL_TRIGGER_ID));
      if !abandoned {
        continue;
      }

      self.store.cancel_active_task_runs(run.id).await?;
      let updated = self
        .store
        .update_pipeline_run(run.id, Utc::now(), RunStatus::Cancelled)
        .await?;
      self.notify_status_changed(&updated);
      warn!(
        run_id = run.id,
        pipeline_id = %run.pipeline_id,
        "cancelled run abandoned by a previous process"
      );
      recovered += 1;
    }

    Ok(recovered)
  }

  /// Create a pending run and schedule its execution asynchronously; returns
  /// immediately so the caller can poll or stream the run's progress.
  pub async fn run_pipeline_now(
    self: &Arc<Self>,
    pipeline_id: &str,
    trigger_id: Option<&str>,
    params: Option<Value>,
  ) -> Result<PipelineRun, OrchestratorError> {
    let pipeline = self
      .get_pipeline(pipeline_id)
      .ok_or_else(|| OrchestratorError::UnknownPipeline(pipeline_id.to_string()))?;

    let trigger: Option<Trigger> = match trigger_id {
      Some(id) => Some(pipeline.get_trigger(id).cloned().ok_or_else(|| {
        OrchestratorError::UnknownTrigger {
          pipeline_id: pipeline.id.clone(),
          trigger_id: id.to_string(),
        }
      })?),
      None => None,
    };

    let trigger_id = trigger
      .as_ref()
      .map(|trigger| trigger.id.clone())
      .unwrap_or_else(|| MANUAL_TRIGGER_ID.to_string());
    let params = params.or_else(|| trigger.as_ref().and_then(|trigger| trigger.params.clone()));

    let run = self
      .store
      .create_pipeline_run(NewPipelineRun {
        pipeline_id: pipeline.id.clone(),
        trigger_id,
        status: RunStatus::Pending,
        input_params: params.clone(),
        reason: REASON_API.to_string(),
        start_time: Utc::now(),
      })
      .await?;

    self.emit_run_update(&run);
    info!(pipeline_id = %pipeline.id, run_id = run.id, "manual run submitted");

    let orchestrator = self.clone();
    let submitted = run.clone();
    tokio::spawn(async move {
      orchestrator.launch(pipeline, submitted, params).await;
    });

    Ok(run)
  }

  /// Entry point for scheduler firings: creates a running run with the
  /// trigger's fixed params and starts its entry tasks.
  pub(crate) async fn run_scheduled(self: Arc<Self>, pipeline: Arc<Pipeline>, trigger: Trigger) {
    let params = trigger.params.clone();
    let created = self
      .store
      .create_pipeline_run(NewPipelineRun {
        pipeline_id: pipeline.id.clone(),
        trigger_id: trigger.id.clone(),
        status: RunStatus::Running,
        input_params: params.clone(),
        reason: REASON_SCHEDULED.to_string(),
        start_time: Utc::now(),
      })
      .await;

    match created {
      Ok(run) => {
        self.notify_status_changed(&run);
        self.launch(pipeline, run, params).await;
      }
      Err(err) => {
        error!(pipeline_id = %pipeline.id, error = %err, "failed to create scheduled run");
      }
    }
  }

  async fn launch(self: Arc<Self>, pipeline: Arc<Pipeline>, run: PipelineRun, params: Option<Value>) {
    let run = if run.status == RunStatus::Pending {
      match self.store.mark_pipeline_run_running(run.id).await {
        Ok(run) => {
          self.notify_status_changed(&run);
          run
        }
        Err(err) => {
          error!(run_id = run.id, error = %err, "failed to mark run running");
          return;
        }
      }
    } else {
      run
    };

    let logger = self.run_logger(&pipeline.id, run.id);
    logger.info(&format!(
      "executing pipeline '{}' #{} via trigger '{}'",
      pipeline.id, run.id, run.trigger_id
    ));

    if let Err(err) = self.start_pipeline_tasks(&pipeline, &run, params).await {
      error!(run_id = run.id, error = %err, "failed to start pipeline tasks");
      logger.error(&format!("failed to start pipeline tasks: {err}"));
      if let Err(err) = self.finish_run(&pipeline, &run, RunStatus::Failed).await {
        error!(run_id = run.id, error = %err, "failed to mark run failed");
      }
    }
  }

  /// Schedule one task run instance for every DAG entry point.
  pub(crate) async fn start_pipeline_tasks(
    self: &Arc<Self>,
    pipeline: &Arc<Pipeline>,
    run: &PipelineRun,
    params: Option<Value>,
  ) -> Result<(), OrchestratorError> {
    let context = json!({ "params": params });
    for task in pipeline.entry_tasks() {
      self
        .schedule_task_instance(pipeline, run.id, task, context.clone(), None, None)
        .await?;
    }
    Ok(())
  }

  /// Create a pending task run row and submit it for concurrent execution.
  /// The submission never blocks the caller: the instance runs on its own
  /// spawned task.
  async fn schedule_task_instance(
    self: &Arc<Self>,
    pipeline: &Arc<Pipeline>,
    run_id: i64,
    task: &Task,
    context: Value,
    parent_task_run_id: Option<String>,
    map_index: Option<i64>,
  ) -> Result<(), OrchestratorError> {
    let task_run = self
      .store
      .create_task_run(NewTaskRun {
        pipeline_run_id: run_id,
        task_id: task.id.clone(),
        status: RunStatus::Pending,
        context,
        parent_task_run_id,
        map_index,
        start_time: Utc::now(),
      })
      .await?;

    info!(run_id, task_id = %task.id, map_index, "task instance scheduled");

    tokio::spawn(executor::execute_task_instance(
      self.clone(),
      pipeline.clone(),
      task.clone(),
      task_run,
    ));
    Ok(())
  }

  /// The single re-entry point after a task run reaches a terminal status.
  ///
  /// Safe to call concurrently for sibling completions: everything after the
  /// broadcast happens under the run's mutex and works on freshly re-read
  /// store state.
  pub async fn handle_task_completion(
    self: &Arc<Self>,
    task_run: &TaskRun,
  ) -> Result<(), OrchestratorError> {
    let run = self.store.get_pipeline_run(task_run.pipeline_run_id).await?;
    self.emit_run_update(&run);

    let pipeline = self
      .get_pipeline(&run.pipeline_id)
      .ok_or_else(|| OrchestratorError::UnknownPipeline(run.pipeline_id.clone()))?;

    let lock = self.run_lock(run.id);
    let guard = lock.lock().await;

    let run = self.store.get_pipeline_run(run.id).await?;
    if run.status != RunStatus::Running {
      // A sibling branch already finished the run.
      return Ok(());
    }

    if task_run.status == RunStatus::Failed {
      // First task failure fails the entire run.
      self.finish_run(&pipeline, &run, RunStatus::Failed).await?;
      drop(guard);
      self.drop_run_lock(run.id);
      return Ok(());
    }

    let completed_output = match &task_run.task_output_id {
      Some(output_id) => self
        .store
        .get_task_run_output_by_id(output_id)
        .await?
        .map(|output| output.data.0),
      None => None,
    };
    let params_context = json!({ "params": run.input_params_value() });

    for downstream in pipeline.downstream_of(&task_run.task_id) {
      let scheduled = self
        .process_downstream(
          &pipeline,
          &run,
          task_run,
          downstream,
          completed_output.as_ref(),
          &params_context,
        )
        .await;

      if let Err(err) = scheduled {
        self.run_logger(&pipeline.id, run.id).error(&err.to_string());
        error!(run_id = run.id, task_id = %downstream.id, error = %err, "downstream scheduling failed");
        if let Err(finish_err) = self.finish_run(&pipeline, &run, RunStatus::Failed).await {
          error!(run_id = run.id, error = %finish_err, "failed to mark run failed");
        }
        drop(guard);
        self.drop_run_lock(run.id);
        return Err(err);
      }
    }

    // Completion check: nothing active anymore and every task accounted for
    // by at least one finished instance (skipped tasks count through their
    // cancelled rows). Chained tasks must additionally have caught up with
    // their mapping source's instance count: a source instance whose
    // completion handler has not run yet still owes a chained instance, and
    // no row is active in that window.
    let active = self
      .store
      .get_task_runs_for_pipeline_run(run.id, None, Some(&RunStatus::ACTIVE))
      .await?;
    if active.is_empty() {
      let finished = self
        .store
        .get_task_runs_for_pipeline_run(run.id, None, Some(&RunStatus::FINISHED))
        .await?;
      let mut counts: HashMap<&str, usize> = HashMap::new();
      for row in &finished {
        *counts.entry(row.task_id.as_str()).or_default() += 1;
      }

      let all_done = pipeline.tasks.iter().all(|task| {
        let Some(&count) = counts.get(task.id.as_str()) else {
          return false;
        };
        if task.mapping_mode == Some(MappingMode::ChainedFanOut) {
          if let Some(source_id) = task.map_upstream_id.as_deref() {
            let source_count = counts.get(source_id).copied().unwrap_or(0);
            if count < source_count {
              return false;
            }
          }
        }
        count > 0
      });

      if all_done {
        self.finish_run(&pipeline, &run, RunStatus::Completed).await?;
        drop(guard);
        self.drop_run_lock(run.id);
      }
    }

    Ok(())
  }

  /// Decide what a completed task run means for one downstream task.
  async fn process_downstream(
    self: &Arc<Self>,
    pipeline: &Arc<Pipeline>,
    run: &PipelineRun,
    completed: &TaskRun,
    downstream: &Task,
    completed_output: Option<&Value>,
    params_context: &Value,
  ) -> Result<(), OrchestratorError> {
    let is_map_source = downstream.map_upstream_id.as_deref() == Some(completed.task_id.as_str());

    match downstream.mapping_mode {
      Some(MappingMode::ChainedFanOut) if is_map_source => {
        let Some(index) = completed.map_index else {
          return Err(OrchestratorError::ChainedFromUnmapped {
            task_id: downstream.id.clone(),
            upstream_id: completed.task_id.clone(),
          });
        };
        self
          .schedule_task_instance(
            pipeline,
            run.id,
            downstream,
            params_context.clone(),
            Some(completed.id.clone()),
            Some(index),
          )
          .await
      }

      // Chained tasks are instantiated per mapping-source instance
      // completion; other upstream completions have nothing to add.
      Some(MappingMode::ChainedFanOut) => Ok(()),

      Some(MappingMode::FanOut) => {
        if !self.are_upstream_tasks_complete(run.id, downstream).await? {
          return Ok(());
        }
        if self.has_instances(run.id, &downstream.id).await? {
          // A racing sibling completion expanded it already.
          return Ok(());
        }

        let (source_run_id, output) = if is_map_source {
          (completed.id.clone(), completed_output.cloned())
        } else {
          // A non-mapping upstream unblocked the expansion; re-read the
          // mapping source's completed instance from the store.
          let Some(source_id) = downstream.map_upstream_id.clone() else {
            return Ok(());
          };
          let source_runs = self
            .store
            .get_task_runs_for_pipeline_run(
              run.id,
              Some(&[source_id]),
              Some(&[RunStatus::Completed]),
            )
            .await?;
          let Some(source_run) = source_runs.into_iter().next() else {
            return Ok(());
          };
          let output = match &source_run.task_output_id {
            Some(output_id) => self
              .store
              .get_task_run_output_by_id(output_id)
              .await?
              .map(|output| output.data.0),
            None => None,
          };
          (source_run.id, output)
        };

        self
          .expand_fan_out(pipeline, run, downstream, source_run_id, output, params_context)
          .await
      }

      None => {
        if !self.are_upstream_tasks_complete(run.id, downstream).await? {
          // Another sibling completion will re-check later.
          return Ok(());
        }
        if self.has_instances(run.id, &downstream.id).await? {
          return Ok(());
        }
        self
          .schedule_task_instance(pipeline, run.id, downstream, params_context.clone(), None, None)
          .await
      }
    }
  }

  /// One instance per list element; an empty list skips the task and its
  /// whole downstream subtree.
  async fn expand_fan_out(
    self: &Arc<Self>,
    pipeline: &Arc<Pipeline>,
    run: &PipelineRun,
    downstream: &Task,
    source_run_id: String,
    output: Option<Value>,
    params_context: &Value,
  ) -> Result<(), OrchestratorError> {
    let Some(items) = output.as_ref().and_then(|value| value.as_array()) else {
      return Err(OrchestratorError::FanOutSourceNotList {
        task_id: downstream.id.clone(),
        upstream_id: downstream.map_upstream_id.clone().unwrap_or_default(),
      });
    };

    if items.is_empty() {
      let mut skipped = pipeline.transitive_downstream(&downstream.id);
      skipped.insert(downstream.id.clone());
      info!(
        run_id = run.id,
        task_id = %downstream.id,
        skipped = skipped.len(),
        "empty fan-out, skipping subtree"
      );
      self.run_logger(&pipeline.id, run.id).info(&format!(
        "skipping '{}' and its downstream tasks: fan-out input is empty",
        downstream.id
      ));
      self.store.mark_tasks_as_skipped(&skipped, run.id).await?;
      return Ok(());
    }

    for index in 0..items.len() as i64 {
      self
        .schedule_task_instance(
          pipeline,
          run.id,
          downstream,
          params_context.clone(),
          Some(source_run_id.clone()),
          Some(index),
        )
        .await?;
    }
    Ok(())
  }

  /// An upstream counts as complete when it has at least one instance and
  /// every one of its instances is completed; instance cardinality is fixed
  /// at expansion time, so this is also the fan-in barrier.
  async fn are_upstream_tasks_complete(
    &self,
    run_id: i64,
    task: &Task,
  ) -> Result<bool, OrchestratorError> {
    let upstream_ids: Vec<String> = task.upstream_task_ids.iter().cloned().collect();
    if upstream_ids.is_empty() {
      return Ok(true);
    }

    let rows = self
      .store
      .get_task_runs_for_pipeline_run(run_id, Some(&upstream_ids), None)
      .await?;

    for upstream_id in &task.upstream_task_ids {
      let instances: Vec<_> = rows.iter().filter(|row| &row.task_id == upstream_id).collect();
      if instances.is_empty()
        || instances.iter().any(|row| row.status != RunStatus::Completed)
      {
        return Ok(false);
      }
    }
    Ok(true)
  }

  async fn has_instances(&self, run_id: i64, task_id: &str) -> Result<bool, OrchestratorError> {
    let rows = self
      .store
      .get_task_runs_for_pipeline_run(run_id, Some(&[task_id.to_string()]), None)
      .await?;
    Ok(!rows.is_empty())
  }

  async fn finish_run(
    &self,
    pipeline: &Pipeline,
    run: &PipelineRun,
    status: RunStatus,
  ) -> Result<PipelineRun, OrchestratorError> {
    let updated = self.store.update_pipeline_run(run.id, Utc::now(), status).await?;

    let logger = self.run_logger(&pipeline.id, run.id);
    match status {
      RunStatus::Completed => logger.info("pipeline run completed"),
      RunStatus::Failed => logger.error("pipeline run failed"),
      _ => logger.warning(&format!("pipeline run finished: {status:?}")),
    }

    self.notify_status_changed(&updated);
    self.close_run_log(run.id);
    info!(pipeline_id = %pipeline.id, run_id = run.id, status = ?status, "pipeline run finished");
    Ok(updated)
  }

  /// Logger bound to a run; the underlying file sink is shared by all of the
  /// run's instances and kept open until the run finishes.
  pub(crate) fn run_logger(&self, pipeline_id: &str, run_id: i64) -> RunLogger {
    let sink = {
      let mut sinks = self.sinks.lock();
      match sinks.get(&run_id) {
        Some(sink) => Some(sink.clone()),
        None => match self.logs.open(run_id) {
          Ok(sink) => {
            let sink = Arc::new(sink);
            sinks.insert(run_id, sink.clone());
            Some(sink)
          }
          Err(err) => {
            warn!(run_id, error = %err, "failed to open run log file");
            None
          }
        },
      }
    };
    RunLogger::new(sink, pipeline_id, run_id)
  }

  fn close_run_log(&self, run_id: i64) {
    self.sinks.lock().remove(&run_id);
  }

  pub(crate) fn emit_run_update(&self, run: &PipelineRun) {
    self.notifier.notify(RunEvent::RunUpdate {
      pipeline: run.pipeline_id.clone(),
      trigger: run.trigger_id.clone(),
      run: RunSummary::from(run),
    });
  }

  fn notify_status_changed(&self, run: &PipelineRun) {
    self.notifier.notify(RunEvent::RunStatusChanged {
      pipeline: run.pipeline_id.clone(),
      run: RunSummary::from(run),
    });
    self.emit_run_update(run);
  }

  fn run_lock(&self, run_id: i64) -> Arc<RunMutex<()>> {
    self
      .run_locks
      .lock()
      .entry(run_id)
      .or_insert_with(|| Arc::new(RunMutex::new(())))
      .clone()
  }

  fn drop_run_lock(&self, run_id: i64) {
    self.run_locks.lock().remove(&run_id);
  }
}
