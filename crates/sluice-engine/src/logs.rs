//! Per-run structured log files.
//!
//! Every pipeline run gets its own JSON-lines file under
//! `<data_dir>/runs/run_<id>/`, so two runs of the same pipeline never
//! interleave into one stream. Records carry the pipeline/task/run/map-index
//! correlation fields; writes are best-effort and never fail a task.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use sluice_pipeline::LogLevel;
use tracing::warn;

const RUN_LOGS_FILE: &str = "logs.jsonl";

/// One line of a run log.
#[derive(Debug, Serialize)]
struct LogRecord<'a> {
  level: &'a str,
  message: &'a str,
  #[serde(rename = "loggerName")]
  logger_name: &'a str,
  /// UTC, millisecond precision.
  timestamp: String,
  pipeline: &'a str,
  task: Option<&'a str>,
  run_id: i64,
  map_index: Option<i64>,
}

/// Locates and opens per-run log files under a base data directory.
#[derive(Debug, Clone)]
pub struct RunLogStore {
  base: PathBuf,
}

impl RunLogStore {
  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  fn run_dir(&self, run_id: i64) -> PathBuf {
    self.base.join("runs").join(format!("run_{run_id}"))
  }

  pub fn log_path(&self, run_id: i64) -> PathBuf {
    self.run_dir(run_id).join(RUN_LOGS_FILE)
  }

  /// Open (appending) the log file of a run.
  pub fn open(&self, run_id: i64) -> std::io::Result<RunLogSink> {
    let dir = self.run_dir(run_id);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(dir.join(RUN_LOGS_FILE))?;
    Ok(RunLogSink {
      file: Mutex::new(file),
    })
  }

  /// Read back a run's raw log text, `None` if the run never logged.
  pub fn read(&self, run_id: i64) -> std::io::Result<Option<String>> {
    let path = self.log_path(run_id);
    if !path.exists() {
      return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(Some(text.trim_end().to_string()))
  }

  pub fn base(&self) -> &Path {
    &self.base
  }
}

/// The open file behind one run's log; shared by all of the run's loggers.
#[derive(Debug)]
pub struct RunLogSink {
  file: Mutex<File>,
}

impl RunLogSink {
  fn write(&self, record: &LogRecord<'_>) {
    let line = match serde_json::to_string(record) {
      Ok(line) => line,
      Err(err) => {
        warn!(error = %err, "failed to serialize run log record");
        return;
      }
    };
    let mut file = match self.file.lock() {
      Ok(file) => file,
      Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(err) = writeln!(file, "{line}") {
      warn!(error = %err, "failed to write run log record");
    }
  }
}

/// A logger bound to a pipeline run, and optionally to one task instance.
///
/// Carries no sink when opening the log file failed; records are then
/// dropped (the failure was already reported through tracing).
#[derive(Debug, Clone)]
pub struct RunLogger {
  sink: Option<Arc<RunLogSink>>,
  pipeline: String,
  run_id: i64,
  task: Option<String>,
  map_index: Option<i64>,
  name: String,
}

impl RunLogger {
  pub fn new(sink: Option<Arc<RunLogSink>>, pipeline: impl Into<String>, run_id: i64) -> Self {
    let pipeline = pipeline.into();
    Self {
      name: format!("sluice.{run_id}"),
      sink,
      pipeline,
      run_id,
      task: None,
      map_index: None,
    }
  }

  /// Derive a logger for one task instance. Fanned-out instances get their
  /// map index in the logger name so siblings are distinguishable.
  pub fn for_task(&self, task_id: &str, map_index: Option<i64>) -> RunLogger {
    let mut name = format!("sluice.{}-{}", self.run_id, task_id);
    if let Some(index) = map_index {
      name.push_str(&format!("-{index}"));
    }
    RunLogger {
      sink: self.sink.clone(),
      pipeline: self.pipeline.clone(),
      run_id: self.run_id,
      task: Some(task_id.to_string()),
      map_index,
      name,
    }
  }

  pub fn log(&self, level: LogLevel, message: &str) {
    let Some(sink) = &self.sink else { return };
    sink.write(&LogRecord {
      level: level.as_str(),
      message,
      logger_name: &self.name,
      timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
      pipeline: &self.pipeline,
      task: self.task.as_deref(),
      run_id: self.run_id,
      map_index: self.map_index,
    });
  }

  pub fn debug(&self, message: &str) {
    self.log(LogLevel::Debug, message);
  }

  pub fn info(&self, message: &str) {
    self.log(LogLevel::Info, message);
  }

  pub fn warning(&self, message: &str) {
    self.log(LogLevel::Warning, message);
  }

  pub fn error(&self, message: &str) {
    self.log(LogLevel::Error, message);
  }
}
