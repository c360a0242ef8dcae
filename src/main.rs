use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice_orchestrator::{Orchestrator, OrchestratorConfig};
use sluice_store::{SqliteStore, Store};

mod demo;

/// Sluice - a pipeline orchestration engine
#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.sluice)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Register the demo pipelines and serve their triggers until Ctrl-C
  Serve,

  /// Run a pipeline immediately and wait for its result
  Run {
    /// The pipeline id to run
    pipeline_id: String,

    /// Input parameters as a JSON object
    #[arg(long)]
    params: Option<String>,
  },

  /// Show recent runs of a pipeline
  History {
    /// The pipeline id to inspect
    pipeline_id: String,
  },

  /// Print the captured log of a run
  Logs {
    /// The run id to read
    run_id: i64,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".sluice")
  });

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Serve) => rt.block_on(serve(data_dir)),
    Some(Commands::Run { pipeline_id, params }) => {
      rt.block_on(run_once(data_dir, pipeline_id, params))
    }
    Some(Commands::History { pipeline_id }) => rt.block_on(history(data_dir, pipeline_id)),
    Some(Commands::Logs { run_id }) => rt.block_on(logs(data_dir, run_id)),
    None => {
      println!("sluice - use --help to see available commands");
      Ok(())
    }
  }
}

async fn open_orchestrator(data_dir: &Path) -> Result<Arc<Orchestrator>> {
  std::fs::create_dir_all(data_dir)
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let store = SqliteStore::open(&data_dir.join("sluice.db"))
    .await
    .context("failed to open database")?;
  let store: Arc<dyn Store> = Arc::new(store);

  let orchestrator = Arc::new(Orchestrator::new(
    store,
    OrchestratorConfig {
      data_dir: data_dir.to_path_buf(),
    },
  ));
  demo::register_demo_pipelines(&orchestrator).context("failed to build demo pipelines")?;
  Ok(orchestrator)
}

async fn serve(data_dir: PathBuf) -> Result<()> {
  let orchestrator = open_orchestrator(&data_dir).await?;

  let cancel = CancellationToken::new();
  orchestrator
    .start(cancel.clone())
    .await
    .context("failed to start orchestrator")?;

  let now = chrono::Utc::now();
  for pipeline in orchestrator.pipelines() {
    for trigger in &pipeline.triggers {
      match trigger.next_fire_time(now) {
        Some(next) => eprintln!(
          "{}: next fire at {}",
          sluice_pipeline::job_id(&pipeline.id, &trigger.id),
          next
        ),
        None => eprintln!(
          "{}: paused",
          sluice_pipeline::job_id(&pipeline.id, &trigger.id)
        ),
      }
    }
  }

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;
  eprintln!("shutting down");
  cancel.cancel();
  Ok(())
}

async fn run_once(data_dir: PathBuf, pipeline_id: String, params: Option<String>) -> Result<()> {
  let orchestrator = open_orchestrator(&data_dir).await?;

  let params = params
    .map(|raw| serde_json::from_str(&raw))
    .transpose()
    .context("params must be valid JSON")?;

  let run = orchestrator.run_pipeline_now(&pipeline_id, None, params).await?;
  eprintln!("run #{} submitted", run.id);

  let store = orchestrator.store().clone();
  let run = loop {
    let run = store.get_pipeline_run(run.id).await?;
    if run.status.is_finished() {
      break run;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
  };

  println!("run #{} finished: {:?} in {} ms", run.id, run.status, run.duration);
  for task_run in store.get_task_runs_for_pipeline_run(run.id, None, None).await? {
    let instance = match task_run.map_index {
      Some(index) => format!("{}[{}]", task_run.task_id, index),
      None => task_run.task_id.clone(),
    };
    println!(
      "  {instance}: {:?} ({} ms)",
      task_run.status,
      task_run.duration.unwrap_or(0)
    );
  }
  Ok(())
}

async fn history(data_dir: PathBuf, pipeline_id: String) -> Result<()> {
  let orchestrator = open_orchestrator(&data_dir).await?;

  let runs = orchestrator
    .store()
    .list_pipeline_runs(Some(&pipeline_id), None)
    .await?;
  if runs.is_empty() {
    println!("no runs recorded for '{pipeline_id}'");
    return Ok(());
  }

  for run in runs {
    println!(
      "#{} [{}] {:?} started {} ({} ms, reason: {})",
      run.id, run.trigger_id, run.status, run.start_time, run.duration, run.reason
    );
  }
  Ok(())
}

async fn logs(data_dir: PathBuf, run_id: i64) -> Result<()> {
  let orchestrator = open_orchestrator(&data_dir).await?;

  match orchestrator.run_logs().read(run_id)? {
    Some(text) => println!("{text}"),
    None => println!("no log recorded for run #{run_id}"),
  }
  Ok(())
}
