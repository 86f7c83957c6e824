//! Runner configuration.

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::events::EventFilter;

/// Runner settings.
///
/// Every field has a default, so a partial JSON document is enough:
/// ```json
/// { "event_buffer": 64, "max_concurrency": 4 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
  /// Capacity of the bounded channel a stream reads events from. A consumer
  /// that falls this far behind slows the scheduler down.
  pub event_buffer: usize,
  /// Upper bound on node bodies running at the same time in one run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_concurrency: Option<usize>,
  /// Filter used by [`WorkflowRunner::stream_default`](crate::WorkflowRunner::stream_default).
  pub default_filter: EventFilter,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      event_buffer: 256,
      max_concurrency: None,
      default_filter: EventFilter::default(),
    }
  }
}

impl RunnerConfig {
  pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
    Ok(serde_json::from_str(json)?)
  }

  pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
    self.max_concurrency = Some(max_concurrency);
    self
  }

  pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
    self.event_buffer = event_buffer;
    self
  }
}
