use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::prettify_name;

/// Trigger id recorded on runs started by hand rather than by a schedule.
pub const MANUAL_TRIGGER_ID: &str = "_manual";

/// When a trigger fires. The calendar math intentionally stays minimal: the
/// scheduler adapter only needs "next fire time after T".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Schedule {
  Interval {
    every: Duration,
    /// Anchor for the fire-time series. Without it the interval is
    /// unanchored and simply fires `every` after each evaluation.
    start_at: Option<DateTime<Utc>>,
  },
}

impl Schedule {
  pub fn interval(every: Duration) -> Self {
    Schedule::Interval {
      every,
      start_at: None,
    }
  }

  pub fn interval_from(every: Duration, start_at: DateTime<Utc>) -> Self {
    Schedule::Interval {
      every,
      start_at: Some(start_at),
    }
  }

  /// The first fire time strictly after `now`, or `None` if the schedule
  /// can never fire (zero-length interval).
  pub fn next_fire_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Interval { every, start_at } => {
        let every = chrono::Duration::from_std(*every).ok()?;
        if every <= chrono::Duration::zero() {
          return None;
        }
        let origin = match start_at {
          None => return Some(now + every),
          Some(origin) => *origin,
        };
        if origin > now {
          return Some(origin);
        }
        let elapsed_ms = (now - origin).num_milliseconds();
        let periods = elapsed_ms / every.num_milliseconds() + 1;
        Some(origin + every * periods as i32)
      }
    }
  }
}

/// A named schedule binding, owned by exactly one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub schedule: Schedule,
  /// Fixed input parameters applied to scheduled firings.
  pub params: Option<Value>,
  pub paused: bool,
}

impl Trigger {
  pub fn new(id: impl Into<String>, schedule: Schedule) -> Self {
    let id = id.into();
    let name = prettify_name(&id);
    Self {
      id,
      name,
      description: None,
      schedule,
      params: None,
      paused: false,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn with_params(mut self, params: Value) -> Self {
    self.params = Some(params);
    self
  }

  pub fn paused(mut self) -> Self {
    self.paused = true;
    self
  }

  /// Informational next fire time, computed on read, never stored.
  pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if self.paused {
      return None;
    }
    self.schedule.next_fire_after(now)
  }
}
