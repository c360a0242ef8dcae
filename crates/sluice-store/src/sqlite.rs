use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::types::{
  NewPipelineRun, NewTaskRun, PipelineRun, RunStatus, TaskRun, TaskRunOutput, TaskRunUpdate,
};
use crate::{Store, StoreError};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a store over an existing connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) a database file and run migrations.
  pub async fn open(path: &Path) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// An in-memory database, useful for tests. Pinned to a single connection
  /// so the database outlives individual acquires.
  pub async fn in_memory() -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(&self.pool).await
  }
}

const PIPELINE_RUN_COLUMNS: &str =
  "id, pipeline_id, trigger_id, status, start_time, end_time, duration, input_params, reason";

const TASK_RUN_COLUMNS: &str = "id, pipeline_run_id, task_id, status, start_time, end_time, \
   duration, context, task_output_id, map_index, parent_task_run_id";

#[async_trait]
impl Store for SqliteStore {
  async fn create_pipeline_run(&self, new_run: NewPipelineRun) -> Result<PipelineRun, StoreError> {
    let result = sqlx::query(
      r#"
            INSERT INTO pipeline_runs (pipeline_id, trigger_id, status, start_time, input_params, reason)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&new_run.pipeline_id)
    .bind(&new_run.trigger_id)
    .bind(new_run.status)
    .bind(new_run.start_time)
    .bind(new_run.input_params.map(Json))
    .bind(&new_run.reason)
    .execute(&self.pool)
    .await?;

    self.get_pipeline_run(result.last_insert_rowid()).await
  }

  async fn get_pipeline_run(&self, run_id: i64) -> Result<PipelineRun, StoreError> {
    sqlx::query_as(&format!(
      "SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs WHERE id = ?"
    ))
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("pipeline run {run_id}")))
  }

  async fn update_pipeline_run(
    &self,
    run_id: i64,
    end_time: DateTime<Utc>,
    status: RunStatus,
  ) -> Result<PipelineRun, StoreError> {
    let run = self.get_pipeline_run(run_id).await?;
    let duration = (end_time - run.start_time).num_milliseconds().max(0);

    sqlx::query(
      r#"
            UPDATE pipeline_runs
            SET status = ?, end_time = ?, duration = ?
            WHERE id = ?
            "#,
    )
    .bind(status)
    .bind(end_time)
    .bind(duration)
    .bind(run_id)
    .execute(&self.pool)
    .await?;

    self.get_pipeline_run(run_id).await
  }

  async fn mark_pipeline_run_running(&self, run_id: i64) -> Result<PipelineRun, StoreError> {
    sqlx::query("UPDATE pipeline_runs SET status = ? WHERE id = ?")
      .bind(RunStatus::Running)
      .bind(run_id)
      .execute(&self.pool)
      .await?;

    self.get_pipeline_run(run_id).await
  }

  async fn list_pipeline_runs(
    &self,
    pipeline_id: Option<&str>,
    trigger_id: Option<&str>,
  ) -> Result<Vec<PipelineRun>, StoreError> {
    let mut query: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
      "SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs WHERE 1 = 1"
    ));
    if let Some(pipeline_id) = pipeline_id {
      query.push(" AND pipeline_id = ").push_bind(pipeline_id);
    }
    if let Some(trigger_id) = trigger_id {
      query.push(" AND trigger_id = ").push_bind(trigger_id);
    }
    query.push(" ORDER BY id DESC LIMIT 30");

    Ok(query.build_query_as::<PipelineRun>().fetch_all(&self.pool).await?)
  }

  async fn get_latest_pipeline_run(
    &self,
    pipeline_id: &str,
    trigger_id: &str,
  ) -> Result<Option<PipelineRun>, StoreError> {
    Ok(
      sqlx::query_as(&format!(
        "SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs \
         WHERE pipeline_id = ? AND trigger_id = ? ORDER BY id DESC LIMIT 1"
      ))
      .bind(pipeline_id)
      .bind(trigger_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn list_pipeline_runs_by_status(
    &self,
    statuses: &[RunStatus],
  ) -> Result<Vec<PipelineRun>, StoreError> {
    if statuses.is_empty() {
      return Ok(Vec::new());
    }

    let mut query: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
      "SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs WHERE status IN ("
    ));
    let mut separated = query.separated(", ");
    for status in statuses {
      separated.push_bind(*status);
    }
    query.push(") ORDER BY id");

    Ok(query.build_query_as::<PipelineRun>().fetch_all(&self.pool).await?)
  }

  async fn create_task_run(&self, new_task_run: NewTaskRun) -> Result<TaskRun, StoreError> {
    let id = Uuid::now_v7().to_string();

    sqlx::query(
      r#"
            INSERT INTO task_runs
              (id, pipeline_run_id, task_id, status, start_time, context, map_index, parent_task_run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&id)
    .bind(new_task_run.pipeline_run_id)
    .bind(&new_task_run.task_id)
    .bind(new_task_run.status)
    .bind(new_task_run.start_time)
    .bind(Json(new_task_run.context))
    .bind(new_task_run.map_index)
    .bind(&new_task_run.parent_task_run_id)
    .execute(&self.pool)
    .await?;

    self.get_task_run(&id).await
  }

  async fn get_task_run(&self, task_run_id: &str) -> Result<TaskRun, StoreError> {
    sqlx::query_as(&format!(
      "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE id = ?"
    ))
    .bind(task_run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("task run {task_run_id}")))
  }

  async fn update_task_run(
    &self,
    task_run_id: &str,
    update: TaskRunUpdate,
  ) -> Result<TaskRun, StoreError> {
    sqlx::query(
      r#"
            UPDATE task_runs
            SET status = COALESCE(?, status),
                end_time = COALESCE(?, end_time),
                duration = COALESCE(?, duration),
                task_output_id = COALESCE(?, task_output_id)
            WHERE id = ?
            "#,
    )
    .bind(update.status)
    .bind(update.end_time)
    .bind(update.duration)
    .bind(&update.task_output_id)
    .bind(task_run_id)
    .execute(&self.pool)
    .await?;

    self.get_task_run(task_run_id).await
  }

  async fn get_task_runs_for_pipeline_run(
    &self,
    run_id: i64,
    task_ids: Option<&[String]>,
    statuses: Option<&[RunStatus]>,
  ) -> Result<Vec<TaskRun>, StoreError> {
    let mut query: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
      "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE pipeline_run_id = "
    ));
    query.push_bind(run_id);

    if let Some(task_ids) = task_ids {
      if task_ids.is_empty() {
        return Ok(Vec::new());
      }
      query.push(" AND task_id IN (");
      let mut separated = query.separated(", ");
      for task_id in task_ids {
        separated.push_bind(task_id.clone());
      }
      query.push(")");
    }

    if let Some(statuses) = statuses {
      if statuses.is_empty() {
        return Ok(Vec::new());
      }
      query.push(" AND status IN (");
      let mut separated = query.separated(", ");
      for status in statuses {
        separated.push_bind(*status);
      }
      query.push(")");
    }

    query.push(" ORDER BY start_time, id");

    Ok(query.build_query_as().fetch_all(&self.pool).await?)
  }

  async fn mark_tasks_as_skipped(
    &self,
    task_ids: &BTreeSet<String>,
    run_id: i64,
  ) -> Result<(), StoreError> {
    let now = Utc::now();
    for task_id in task_ids {
      // OR IGNORE: two skip propagations may share a downstream task.
      sqlx::query(
        r#"
                INSERT OR IGNORE INTO task_runs (id, pipeline_run_id, task_id, status, start_time, end_time, duration)
                VALUES (?, ?, ?, ?, ?, ?, 0)
                "#,
      )
      .bind(Uuid::now_v7().to_string())
      .bind(run_id)
      .bind(task_id)
      .bind(RunStatus::Cancelled)
      .bind(now)
      .bind(now)
      .execute(&self.pool)
      .await?;
    }

    Ok(())
  }

  async fn cancel_active_task_runs(&self, run_id: i64) -> Result<u64, StoreError> {
    let mut query: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE task_runs SET status = ");
    query.push_bind(RunStatus::Cancelled);
    query.push(" WHERE pipeline_run_id = ").push_bind(run_id);
    query.push(" AND status IN (");
    let mut separated = query.separated(", ");
    for status in RunStatus::ACTIVE {
      separated.push_bind(status);
    }
    query.push(")");

    Ok(query.build().execute(&self.pool).await?.rows_affected())
  }

  async fn create_task_run_output(
    &self,
    task_run_id: &str,
    data: Value,
    mimetype: &str,
    encoding: &str,
  ) -> Result<TaskRunOutput, StoreError> {
    let id = Uuid::now_v7().to_string();
    let size = serde_json::to_vec(&data).map(|bytes| bytes.len() as i64).unwrap_or(0);

    sqlx::query(
      r#"
            INSERT INTO task_run_outputs (id, mimetype, encoding, size, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
    )
    .bind(&id)
    .bind(mimetype)
    .bind(encoding)
    .bind(size)
    .bind(Json(data))
    .execute(&self.pool)
    .await?;

    sqlx::query("UPDATE task_runs SET task_output_id = ? WHERE id = ?")
      .bind(&id)
      .bind(task_run_id)
      .execute(&self.pool)
      .await?;

    self
      .get_task_run_output_by_id(&id)
      .await?
      .ok_or_else(|| StoreError::NotFound(format!("task run output {id}")))
  }

  async fn get_task_run_output_by_id(
    &self,
    output_id: &str,
  ) -> Result<Option<TaskRunOutput>, StoreError> {
    Ok(
      sqlx::query_as("SELECT id, mimetype, encoding, size, data FROM task_run_outputs WHERE id = ?")
        .bind(output_id)
        .fetch_optional(&self.pool)
        .await?,
    )
  }
}
