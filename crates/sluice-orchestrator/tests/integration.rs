//! Integration tests driving full pipeline runs against an in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use sluice_engine::{ChannelNotifier, RunEvent};
use sluice_orchestrator::{Orchestrator, OrchestratorConfig};
use sluice_pipeline::{Binding, MANUAL_TRIGGER_ID, Pipeline, Task, TaskFn};
use sluice_store::{
  NewPipelineRun, NewTaskRun, PipelineRun, RunStatus, SqliteStore, Store, TaskRun,
};

async fn setup() -> (Arc<Orchestrator>, Arc<dyn Store>, tempfile::TempDir) {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
  let orchestrator = Arc::new(Orchestrator::new(
    store.clone(),
    OrchestratorConfig {
      data_dir: dir.path().to_path_buf(),
    },
  ));
  (orchestrator, store, dir)
}

async fn wait_until_finished(store: &Arc<dyn Store>, run_id: i64) -> PipelineRun {
  for _ in 0..500 {
    let run = store.get_pipeline_run(run_id).await.unwrap();
    if run.status.is_finished() {
      return run;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("run {run_id} did not finish in time");
}

async fn task_runs_for(store: &Arc<dyn Store>, run_id: i64, task_id: &str) -> Vec<TaskRun> {
  store
    .get_task_runs_for_pipeline_run(run_id, Some(&[task_id.to_string()]), None)
    .await
    .unwrap()
}

async fn output_of(store: &Arc<dyn Store>, task_run: &TaskRun) -> Option<Value> {
  match &task_run.task_output_id {
    Some(output_id) => store
      .get_task_run_output_by_id(output_id)
      .await
      .unwrap()
      .map(|output| output.data.0),
    None => None,
  }
}

fn constant(id: &str, value: Value) -> Task {
  Task::new(
    id,
    TaskFn::from_sync(move |_invocation| Ok(Some(value.clone()))),
  )
}

fn forward(id: &str, upstream: &str) -> Task {
  Task::new(
    id,
    TaskFn::from_sync(|invocation| Ok(invocation.input("data").cloned())),
  )
  .with_binding(Binding::new("data", upstream))
}

#[tokio::test]
async fn diamond_runs_each_task_once_and_joins_after_both_branches() {
  let (orchestrator, store, _dir) = setup().await;

  let join_calls = Arc::new(AtomicUsize::new(0));
  let join_counter = join_calls.clone();

  let pipeline = Pipeline::builder("diamond")
    .add_task(constant("a", json!({"x": 1})))
    .add_task(forward("b", "a"))
    .add_task(forward("c", "a"))
    .add_task(Task::new(
      "d",
      TaskFn::from_sync(move |_invocation| {
        join_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!("joined")))
      }),
    ))
    .add_dependency("a", "b")
    .add_dependency("a", "c")
    .add_dependency("b", "d")
    .add_dependency("c", "d")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator
    .run_pipeline_now("diamond", None, None)
    .await
    .unwrap();
  assert_eq!(run.status, RunStatus::Pending);

  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);
  assert!(finished.end_time.is_some());

  for task_id in ["a", "b", "c", "d"] {
    let rows = task_runs_for(&store, run.id, task_id).await;
    assert_eq!(rows.len(), 1, "task {task_id} should have exactly one instance");
    assert_eq!(rows[0].status, RunStatus::Completed);
  }
  assert_eq!(join_calls.load(Ordering::SeqCst), 1);

  // Both branches received A's full output, round-tripped untouched.
  for task_id in ["b", "c"] {
    let rows = task_runs_for(&store, run.id, task_id).await;
    assert_eq!(output_of(&store, &rows[0]).await, Some(json!({"x": 1})));
  }
}

#[tokio::test]
async fn fan_out_creates_one_instance_per_item() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("mapped")
    .add_task(constant("a", json!([10, 20, 30])))
    .add_task(
      Task::new(
        "b",
        TaskFn::from_async(|invocation| async move {
          let item = invocation.context().get_output_data("a").await?;
          Ok(item)
        }),
      )
      .fan_out("a"),
    )
    .add_dependency("a", "b")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("mapped", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);

  let mut rows = task_runs_for(&store, run.id, "b").await;
  rows.sort_by_key(|row| row.map_index);
  assert_eq!(rows.len(), 3);

  let parent = &task_runs_for(&store, run.id, "a").await[0];
  for (index, row) in rows.iter().enumerate() {
    assert_eq!(row.map_index, Some(index as i64));
    assert_eq!(row.status, RunStatus::Completed);
    assert_eq!(row.parent_task_run_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(
      output_of(&store, row).await,
      Some(json!((index as i64 + 1) * 10))
    );
  }
}

#[tokio::test]
async fn empty_fan_out_skips_the_subtree_and_still_completes() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("empty_map")
    .add_task(constant("a", json!([])))
    .add_task(forward("b", "a").fan_out("a"))
    .add_task(Task::new("c", TaskFn::from_sync(|_invocation| Ok(None))))
    .add_dependency("a", "b")
    .add_dependency("b", "c")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator
    .run_pipeline_now("empty_map", None, None)
    .await
    .unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);

  for task_id in ["b", "c"] {
    let rows = task_runs_for(&store, run.id, task_id).await;
    assert_eq!(rows.len(), 1, "skipped task {task_id} should have one row");
    assert_eq!(rows[0].status, RunStatus::Cancelled);
  }

  let active = store
    .get_task_runs_for_pipeline_run(run.id, None, Some(&RunStatus::ACTIVE))
    .await
    .unwrap();
  assert!(active.is_empty(), "nothing may be left pending");
}

#[tokio::test]
async fn chained_fan_out_inherits_the_map_index() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("chained")
    .add_task(constant("a", json!([1, 2])))
    .add_task(
      Task::new(
        "b",
        TaskFn::from_async(|invocation| async move {
          let item = invocation.context().get_output_data("a").await?;
          let n = item.and_then(|value| value.as_i64()).unwrap_or(0);
          Ok(Some(json!(n * 2)))
        }),
      )
      .fan_out("a"),
    )
    .add_task(
      Task::new(
        "c",
        TaskFn::from_async(|invocation| async move {
          let item = invocation.context().get_output_data("b").await?;
          let n = item.and_then(|value| value.as_i64()).unwrap_or(0);
          Ok(Some(json!(n + 1)))
        }),
      )
      .chained_fan_out("b"),
    )
    .add_dependency("a", "b")
    .add_dependency("b", "c")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("chained", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);

  let mut b_rows = task_runs_for(&store, run.id, "b").await;
  b_rows.sort_by_key(|row| row.map_index);
  let mut c_rows = task_runs_for(&store, run.id, "c").await;
  c_rows.sort_by_key(|row| row.map_index);

  assert_eq!(c_rows.len(), 2);
  for (index, row) in c_rows.iter().enumerate() {
    assert_eq!(row.map_index, Some(index as i64));
    // each chained instance descends from the fan-out instance of the same index
    assert_eq!(
      row.parent_task_run_id.as_deref(),
      Some(b_rows[index].id.as_str())
    );
  }
  assert_eq!(output_of(&store, &c_rows[0]).await, Some(json!(3)));
  assert_eq!(output_of(&store, &c_rows[1]).await, Some(json!(5)));
}

#[tokio::test]
async fn first_failure_fails_the_run_and_blocks_downstream() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("failing")
    .add_task(Task::new(
      "a",
      TaskFn::from_sync(|_invocation| Err("exploded on purpose".into())),
    ))
    .add_task(Task::new("b", TaskFn::from_sync(|_invocation| Ok(None))))
    .add_dependency("a", "b")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("failing", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Failed);

  let a_rows = task_runs_for(&store, run.id, "a").await;
  assert_eq!(a_rows.len(), 1);
  assert_eq!(a_rows[0].status, RunStatus::Failed);
  assert!(a_rows[0].task_output_id.is_none());

  let b_rows = task_runs_for(&store, run.id, "b").await;
  assert!(b_rows.is_empty(), "downstream of a failed task must never be scheduled");
}

#[tokio::test]
async fn concurrent_sibling_completions_schedule_the_join_exactly_once() {
  let (orchestrator, store, _dir) = setup().await;

  let join_calls = Arc::new(AtomicUsize::new(0));
  let join_counter = join_calls.clone();
  let items: Vec<i64> = (0..12).collect();

  let pipeline = Pipeline::builder("hammer")
    .add_task(constant("a", json!(items)))
    .add_task(
      Task::new(
        "b",
        TaskFn::from_async(|invocation| async move {
          invocation
            .context()
            .get_output_data("a")
            .await
            .map_err(Into::into)
        }),
      )
      .fan_out("a"),
    )
    .add_task(Task::new(
      "c",
      TaskFn::from_sync(move |_invocation| {
        join_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!("fan-in")))
      }),
    ))
    .add_dependency("a", "b")
    .add_dependency("b", "c")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("hammer", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);

  let b_rows = task_runs_for(&store, run.id, "b").await;
  assert_eq!(b_rows.len(), 12);

  let c_rows = task_runs_for(&store, run.id, "c").await;
  assert_eq!(c_rows.len(), 1, "the fan-in join must be instantiated exactly once");
  assert_eq!(join_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fan_out_over_a_non_list_output_fails_the_run() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("bad_map")
    .add_task(constant("a", json!({"not": "a list"})))
    .add_task(forward("b", "a").fan_out("a"))
    .add_dependency("a", "b")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("bad_map", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Failed);

  let b_rows = task_runs_for(&store, run.id, "b").await;
  assert!(b_rows.is_empty(), "no instance may be created from a non-list output");
}

#[tokio::test]
async fn chaining_from_an_unmapped_instance_fails_the_run() {
  let (orchestrator, store, _dir) = setup().await;

  // b chains on a, but a is an ordinary task, so its single instance
  // carries no map index to inherit.
  let pipeline = Pipeline::builder("bad_chain")
    .add_task(constant("a", json!([1, 2])))
    .add_task(forward("b", "a").chained_fan_out("a"))
    .add_dependency("a", "b")
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("bad_chain", None, None).await.unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Failed);
}

#[tokio::test]
async fn params_are_validated_and_passed_to_tasks() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("parametrized")
    .add_task(Task::new(
      "echo",
      TaskFn::from_sync(|invocation| Ok(invocation.params().cloned())),
    ))
    .with_params_schema(json!({
      "type": "object",
      "properties": {"n": {"type": "integer"}},
      "required": ["n"]
    }))
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator
    .run_pipeline_now("parametrized", None, Some(json!({"n": 7})))
    .await
    .unwrap();
  let finished = wait_until_finished(&store, run.id).await;
  assert_eq!(finished.status, RunStatus::Completed);
  assert_eq!(
    finished.input_params_value(),
    Some(json!({"n": 7})),
    "run must snapshot its resolved params"
  );
  let echo_rows = task_runs_for(&store, run.id, "echo").await;
  assert_eq!(output_of(&store, &echo_rows[0]).await, Some(json!({"n": 7})));

  // Non-conforming params fail the task, and so the run.
  let bad = orchestrator
    .run_pipeline_now("parametrized", None, Some(json!({"n": "seven"})))
    .await
    .unwrap();
  let finished = wait_until_finished(&store, bad.id).await;
  assert_eq!(finished.status, RunStatus::Failed);
}

#[tokio::test]
async fn manual_run_is_pending_first_and_events_are_broadcast() {
  let dir = tempfile::tempdir().unwrap();
  let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
  let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
  let orchestrator = Arc::new(Orchestrator::with_notifier(
    store.clone(),
    OrchestratorConfig {
      data_dir: dir.path().to_path_buf(),
    },
    Arc::new(ChannelNotifier::new(sender)),
  ));

  let pipeline = Pipeline::builder("observed")
    .add_task(constant("only", json!(1)))
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("observed", None, None).await.unwrap();
  assert_eq!(run.status, RunStatus::Pending);
  assert_eq!(run.trigger_id, MANUAL_TRIGGER_ID);
  assert_eq!(run.reason, "api");

  wait_until_finished(&store, run.id).await;
  // the final notification is emitted right after the status flips; give it
  // a moment to land in the channel
  tokio::time::sleep(Duration::from_millis(50)).await;

  let mut saw_completed_transition = false;
  let mut saw_run_update = false;
  while let Ok(event) = receiver.try_recv() {
    match event {
      RunEvent::RunStatusChanged { pipeline, run } => {
        assert_eq!(pipeline, "observed");
        if run.status == RunStatus::Completed {
          saw_completed_transition = true;
        }
      }
      RunEvent::RunUpdate { pipeline, trigger, .. } => {
        assert_eq!(pipeline, "observed");
        assert_eq!(trigger, MANUAL_TRIGGER_ID);
        saw_run_update = true;
      }
    }
  }
  assert!(saw_completed_transition);
  assert!(saw_run_update);
}

#[tokio::test]
async fn startup_recovery_cancels_abandoned_runs() {
  let (orchestrator, store, _dir) = setup().await;

  // A run left RUNNING by a dead process, with an in-flight task.
  let stuck = store
    .create_pipeline_run(NewPipelineRun {
      pipeline_id: "ghost".to_string(),
      trigger_id: "nightly".to_string(),
      status: RunStatus::Running,
      input_params: None,
      reason: "scheduled".to_string(),
      start_time: chrono::Utc::now(),
    })
    .await
    .unwrap();
  store
    .create_task_run(NewTaskRun {
      pipeline_run_id: stuck.id,
      task_id: "t".to_string(),
      status: RunStatus::Running,
      context: json!({}),
      parent_task_run_id: None,
      map_index: None,
      start_time: chrono::Utc::now(),
    })
    .await
    .unwrap();

  // A manual run that never got picked up.
  let pending = store
    .create_pipeline_run(NewPipelineRun {
      pipeline_id: "ghost".to_string(),
      trigger_id: MANUAL_TRIGGER_ID.to_string(),
      status: RunStatus::Pending,
      input_params: None,
      reason: "api".to_string(),
      start_time: chrono::Utc::now(),
    })
    .await
    .unwrap();

  let recovered = orchestrator.recover_stuck_runs().await.unwrap();
  assert_eq!(recovered, 2);

  assert_eq!(
    store.get_pipeline_run(stuck.id).await.unwrap().status,
    RunStatus::Cancelled
  );
  assert_eq!(
    store.get_pipeline_run(pending.id).await.unwrap().status,
    RunStatus::Cancelled
  );
  let task_rows = store
    .get_task_runs_for_pipeline_run(stuck.id, None, None)
    .await
    .unwrap();
  assert_eq!(task_rows[0].status, RunStatus::Cancelled);
}

#[tokio::test]
async fn re_registration_is_a_no_op() {
  let (orchestrator, _store, _dir) = setup().await;

  let build = || {
    Pipeline::builder("twice")
      .add_task(constant("only", json!(null)))
      .build()
      .unwrap()
  };
  orchestrator.register_pipeline(build());
  orchestrator.register_pipeline(build());

  assert_eq!(orchestrator.pipelines().len(), 1);
}

#[tokio::test]
async fn run_log_file_captures_task_records() {
  let (orchestrator, store, _dir) = setup().await;

  let pipeline = Pipeline::builder("logged")
    .add_task(Task::new(
      "speak",
      TaskFn::from_sync(|invocation| {
        invocation.context().info("hello from the task body");
        Ok(None)
      }),
    ))
    .build()
    .unwrap();
  orchestrator.register_pipeline(pipeline);

  let run = orchestrator.run_pipeline_now("logged", None, None).await.unwrap();
  wait_until_finished(&store, run.id).await;

  let text = orchestrator.run_logs().read(run.id).unwrap().unwrap();
  let records: Vec<Value> = text
    .lines()
    .map(|line| serde_json::from_str(line).unwrap())
    .collect();
  assert!(
    records
      .iter()
      .any(|record| record["message"] == "hello from the task body"
        && record["task"] == "speak"
        && record["run_id"] == run.id)
  );
}
