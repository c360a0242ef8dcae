//! Invocation of a single task instance.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sluice_pipeline::{RunContext, Task, TaskFn, TaskInvocation, TaskOutput};

use crate::context::TaskContext;
use crate::error::EngineError;
use crate::schema::validate_value;

/// Resolve the task's declared input bindings and invoke its body.
///
/// Asynchronous bodies are awaited on the current loop; synchronous bodies
/// go through `spawn_blocking` so they cannot stall concurrently executing
/// instances or completion handling. Returning `Ok(None)` means the task
/// produced no output.
pub async fn execute_task(
  task: &Task,
  context: Arc<TaskContext>,
  params: Option<Value>,
) -> Result<TaskOutput, EngineError> {
  let mut inputs = HashMap::new();
  for binding in &task.bindings {
    let value = context.resolve(&binding.upstream_id).await?;

    if let (Some(schema), Some(value)) = (&binding.schema, &value) {
      validate_value(schema, value).map_err(|details| EngineError::InputValidation {
        task_id: task.id.clone(),
        name: binding.name.clone(),
        details,
      })?;
    }

    inputs.insert(binding.name.clone(), value);
  }

  let context: Arc<dyn RunContext> = context;
  let invocation = TaskInvocation {
    params,
    inputs,
    context,
  };

  let result = match &task.run {
    TaskFn::Async(body) => body(invocation).await,
    TaskFn::Sync(body) => {
      let body = body.clone();
      tokio::task::spawn_blocking(move || body(invocation))
        .await
        .map_err(|err| EngineError::Aborted {
          task_id: task.id.clone(),
          message: err.to_string(),
        })?
    }
  };

  result.map_err(|source| EngineError::TaskFailed {
    task_id: task.id.clone(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::logs::RunLogger;
  use serde_json::json;
  use sluice_pipeline::Binding;
  use sluice_store::{
    NewPipelineRun, NewTaskRun, RunStatus, SqliteStore, Store, TaskRun, TaskRunUpdate,
  };

  async fn fixture() -> (Arc<dyn Store>, i64) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let run = store
      .create_pipeline_run(NewPipelineRun {
        pipeline_id: "p".to_string(),
        trigger_id: "_manual".to_string(),
        status: RunStatus::Running,
        input_params: None,
        reason: "api".to_string(),
        start_time: chrono::Utc::now(),
      })
      .await
      .unwrap();
    (store, run.id)
  }

  async fn completed_task_run(
    store: &Arc<dyn Store>,
    run_id: i64,
    task_id: &str,
    map_index: Option<i64>,
    output: Option<serde_json::Value>,
  ) -> TaskRun {
    let task_run = store
      .create_task_run(NewTaskRun {
        pipeline_run_id: run_id,
        task_id: task_id.to_string(),
        status: RunStatus::Pending,
        context: json!({}),
        parent_task_run_id: None,
        map_index,
        start_time: chrono::Utc::now(),
      })
      .await
      .unwrap();
    if let Some(data) = output {
      store
        .create_task_run_output(&task_run.id, data, "application/json", "utf-8")
        .await
        .unwrap();
    }
    store
      .update_task_run(&task_run.id, TaskRunUpdate::status(RunStatus::Completed))
      .await
      .unwrap()
  }

  async fn pending_instance(
    store: &Arc<dyn Store>,
    run_id: i64,
    task_id: &str,
    map_index: Option<i64>,
  ) -> TaskRun {
    store
      .create_task_run(NewTaskRun {
        pipeline_run_id: run_id,
        task_id: task_id.to_string(),
        status: RunStatus::Pending,
        context: json!({}),
        parent_task_run_id: None,
        map_index,
        start_time: chrono::Utc::now(),
      })
      .await
      .unwrap()
  }

  fn logger() -> RunLogger {
    RunLogger::new(None, "p", 1)
  }

  fn wired(task: Task, upstream: &str) -> Task {
    let mut task = task;
    task.upstream_task_ids.insert(upstream.to_string());
    task
  }

  #[tokio::test]
  async fn bindings_receive_full_upstream_output() {
    let (store, run_id) = fixture().await;
    completed_task_run(&store, run_id, "extract", None, Some(json!({"x": 1}))).await;

    let task = wired(
      Task::new(
        "transform",
        TaskFn::from_sync(|invocation| {
          let data = invocation.require_input("data")?;
          Ok(Some(json!({"seen": data.clone()})))
        }),
      )
      .with_binding(Binding::new("data", "extract")),
      "extract",
    );
    let instance = pending_instance(&store, run_id, "transform", None).await;

    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let output = execute_task(&task, Arc::new(context), None).await.unwrap();
    assert_eq!(output, Some(json!({"seen": {"x": 1}})));
  }

  #[tokio::test]
  async fn fan_out_child_reads_its_own_item() {
    let (store, run_id) = fixture().await;
    completed_task_run(&store, run_id, "items", None, Some(json!([10, 20, 30]))).await;

    let task = wired(
      Task::new(
        "per_item",
        TaskFn::from_async(|invocation| async move {
          let item = invocation.context().get_output_data("items").await?;
          Ok(item)
        }),
      )
      .fan_out("items"),
      "items",
    );

    for index in 0..3_i64 {
      let instance = pending_instance(&store, run_id, "per_item", Some(index)).await;
      let context = TaskContext::load(store.clone(), &task, &instance, logger())
        .await
        .unwrap();
      let output = execute_task(&task, Arc::new(context), None).await.unwrap();
      assert_eq!(output, Some(json!((index + 1) * 10)));
    }
  }

  #[tokio::test]
  async fn chained_child_inherits_the_index() {
    let (store, run_id) = fixture().await;
    completed_task_run(&store, run_id, "per_item", Some(0), Some(json!("zero"))).await;
    completed_task_run(&store, run_id, "per_item", Some(1), Some(json!("one"))).await;

    let task = wired(
      Task::new(
        "per_item_next",
        TaskFn::from_async(|invocation| async move {
          invocation.context().get_output_data("per_item").await.map_err(Into::into)
        }),
      )
      .chained_fan_out("per_item"),
      "per_item",
    );

    let instance = pending_instance(&store, run_id, "per_item_next", Some(1)).await;
    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let output = execute_task(&task, Arc::new(context), None).await.unwrap();
    assert_eq!(output, Some(json!("one")));
  }

  #[tokio::test]
  async fn absent_upstream_output_resolves_to_none() {
    let (store, run_id) = fixture().await;
    completed_task_run(&store, run_id, "extract", None, None).await;

    let task = wired(
      Task::new(
        "transform",
        TaskFn::from_sync(|invocation| Ok(Some(json!(invocation.input("data").is_none())))),
      )
      .with_binding(Binding::new("data", "extract")),
      "extract",
    );
    let instance = pending_instance(&store, run_id, "transform", None).await;

    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let output = execute_task(&task, Arc::new(context), None).await.unwrap();
    assert_eq!(output, Some(json!(true)));
  }

  #[tokio::test]
  async fn binding_schema_mismatch_fails_the_task() {
    let (store, run_id) = fixture().await;
    completed_task_run(&store, run_id, "extract", None, Some(json!("not a list"))).await;

    let task = wired(
      Task::new("transform", TaskFn::from_sync(|_invocation| Ok(None))).with_binding(
        Binding::new("rows", "extract").with_schema(json!({"type": "array"})),
      ),
      "extract",
    );
    let instance = pending_instance(&store, run_id, "transform", None).await;

    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let err = execute_task(&task, Arc::new(context), None).await.unwrap_err();
    assert!(matches!(err, EngineError::InputValidation { .. }));
  }

  #[tokio::test]
  async fn task_error_is_propagated_not_swallowed() {
    let (store, run_id) = fixture().await;
    let task = Task::new(
      "explode",
      TaskFn::from_sync(|_invocation| Err("kaboom".into())),
    );
    let instance = pending_instance(&store, run_id, "explode", None).await;

    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let err = execute_task(&task, Arc::new(context), None).await.unwrap_err();
    match err {
      EngineError::TaskFailed { task_id, source } => {
        assert_eq!(task_id, "explode");
        assert_eq!(source.to_string(), "kaboom");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn falsy_output_is_still_an_output() {
    let (store, run_id) = fixture().await;
    let task = Task::new("empty", TaskFn::from_sync(|_invocation| Ok(Some(json!([])))));
    let instance = pending_instance(&store, run_id, "empty", None).await;

    let context = TaskContext::load(store.clone(), &task, &instance, logger())
      .await
      .unwrap();
    let output = execute_task(&task, Arc::new(context), None).await.unwrap();
    assert_eq!(output, Some(json!([])));
  }
}
