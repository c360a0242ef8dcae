//! Run events and notifiers for observability.
//!
//! Events are emitted on every pipeline-run and task-run status change so
//! consumers can observe progress, deliver notifications, stream to UIs,
//! etc. Delivery is best-effort: a notifier must never fail the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_store::{PipelineRun, RunStatus};
use tokio::sync::mpsc;

/// Wire-friendly summary of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub id: i64,
  pub status: RunStatus,
  /// ISO-8601 when serialized.
  pub start_time: DateTime<Utc>,
  /// Milliseconds.
  pub duration: i64,
}

impl From<&PipelineRun> for RunSummary {
  fn from(run: &PipelineRun) -> Self {
    Self {
      id: run.id,
      status: run.status,
      start_time: run.start_time,
      duration: run.duration,
    }
  }
}

/// Events emitted while runs progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEvent {
  /// Broadcast on every task and pipeline status change of a run. The topic
  /// is scoped by pipeline and trigger id for real-time observers.
  RunUpdate {
    pipeline: String,
    trigger: String,
    run: RunSummary,
  },

  /// Emitted on every status transition of a pipeline run; this is the hook
  /// notification channels (mail, chat, ...) subscribe to.
  RunStatusChanged { pipeline: String, run: RunSummary },
}

/// Trait for receiving run events.
///
/// The orchestrator calls `notify` for each event; implementations decide
/// what to do with them (deliver, broadcast, log, ignore, ...) and handle
/// their own failures: errors must be recovered locally, never escalated.
pub trait RunNotifier: Send + Sync {
  fn notify(&self, event: RunEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl RunNotifier for NoopNotifier {
  fn notify(&self, _event: RunEvent) {
    // Intentionally empty
  }
}

/// A notifier that sends events to an unbounded channel.
///
/// The channel is unbounded so a slow consumer cannot block completion
/// handling; event volume is one per status change, so growth stays small.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
    Self { sender }
  }
}

impl RunNotifier for ChannelNotifier {
  fn notify(&self, event: RunEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
