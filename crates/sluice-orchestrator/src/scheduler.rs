//! Trigger scheduling adapter.
//!
//! One async loop per registered (pipeline, trigger) job, keyed
//! `"{pipeline_id}: {trigger_id}"`. Each loop sleeps until the schedule's
//! next fire time and then launches a run on its own task, so a slow run
//! never delays the next firing. The loops stop when the cancellation token
//! trips.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub(crate) struct ScheduledJob {
  pub job_id: String,
  pub pipeline_id: String,
  pub trigger_id: String,
}

pub(crate) fn spawn_jobs(orchestrator: Arc<Orchestrator>, cancel: &CancellationToken) {
  for job in orchestrator.scheduled_jobs() {
    let orchestrator = orchestrator.clone();
    let cancel = cancel.child_token();
    tokio::spawn(async move {
      job_loop(orchestrator, job, cancel).await;
    });
  }
}

async fn job_loop(orchestrator: Arc<Orchestrator>, job: ScheduledJob, cancel: CancellationToken) {
  info!(job_id = %job.job_id, "trigger job started");

  loop {
    let Some(pipeline) = orchestrator.get_pipeline(&job.pipeline_id) else {
      warn!(job_id = %job.job_id, "pipeline disappeared from registry, stopping job");
      break;
    };
    let Some(trigger) = pipeline.get_trigger(&job.trigger_id).cloned() else {
      warn!(job_id = %job.job_id, "trigger not found on pipeline, stopping job");
      break;
    };
    let Some(next) = trigger.schedule.next_fire_after(Utc::now()) else {
      warn!(job_id = %job.job_id, "schedule has no next fire time, stopping job");
      break;
    };

    let delay = (next - Utc::now()).to_std().unwrap_or_default();
    tokio::select! {
      _ = cancel.cancelled() => {
        info!(job_id = %job.job_id, "trigger job cancelled");
        break;
      }
      _ = tokio::time::sleep(delay) => {}
    }

    info!(job_id = %job.job_id, "trigger fired");
    let orchestrator = orchestrator.clone();
    let pipeline = pipeline.clone();
    tokio::spawn(async move {
      orchestrator.run_scheduled(pipeline, trigger).await;
    });
  }
}
