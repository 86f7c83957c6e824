//! Run history used to resume paused executions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use loom_state::State;
use uuid::Uuid;

use crate::emitter::EventEmitter;
use crate::error::RuntimeError;
use crate::events::WorkflowEvent;

/// Source of previously recorded executions.
///
/// Only consulted when a run is resumed by execution id.
#[async_trait]
pub trait HistorySource: Send + Sync {
  /// Events recorded for the execution, oldest first.
  async fn latest_events(&self, execution_id: Uuid) -> Result<Vec<WorkflowEvent>, RuntimeError>;

  /// State snapshots recorded for the execution, oldest first.
  async fn state_snapshot_history(&self, execution_id: Uuid) -> Result<Vec<State>, RuntimeError>;
}

/// Keeps events and snapshots in memory, keyed by execution id.
///
/// Events are filed under [`WorkflowEvent::execution_id`]; snapshots under the
/// state's span id, which the runner sets to the execution id.
#[derive(Debug, Default)]
pub struct InMemoryStore {
  events: Mutex<BTreeMap<Uuid, Vec<WorkflowEvent>>>,
  snapshots: Mutex<BTreeMap<Uuid, Vec<State>>>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self, execution_id: Uuid) -> Vec<WorkflowEvent> {
    self
      .events
      .lock()
      .map(|events| events.get(&execution_id).cloned().unwrap_or_default())
      .unwrap_or_default()
  }

  pub fn snapshot_count(&self, execution_id: Uuid) -> usize {
    self
      .snapshots
      .lock()
      .map(|snapshots| snapshots.get(&execution_id).map(Vec::len).unwrap_or(0))
      .unwrap_or(0)
  }
}

impl EventEmitter for InMemoryStore {
  fn emit(&self, event: &WorkflowEvent) {
    if let Ok(mut events) = self.events.lock() {
      events
        .entry(event.execution_id())
        .or_default()
        .push(event.clone());
    }
  }

  fn snapshot(&self, state: &State) {
    if let Ok(mut snapshots) = self.snapshots.lock() {
      snapshots
        .entry(state.span_id())
        .or_default()
        .push(state.clone());
    }
  }
}

#[async_trait]
impl HistorySource for InMemoryStore {
  async fn latest_events(&self, execution_id: Uuid) -> Result<Vec<WorkflowEvent>, RuntimeError> {
    let events = self.events.lock().map_err(|e| RuntimeError::History {
      message: e.to_string(),
    })?;
    events
      .get(&execution_id)
      .cloned()
      .ok_or_else(|| RuntimeError::NotFound(execution_id.to_string()))
  }

  async fn state_snapshot_history(&self, execution_id: Uuid) -> Result<Vec<State>, RuntimeError> {
    let snapshots = self.snapshots.lock().map_err(|e| RuntimeError::History {
      message: e.to_string(),
    })?;
    snapshots
      .get(&execution_id)
      .cloned()
      .ok_or_else(|| RuntimeError::NotFound(execution_id.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use serde_json::json;

  use super::*;
  use crate::events::EventBody;

  #[tokio::test]
  async fn test_records_by_execution() {
    let store = InMemoryStore::new();
    let execution_id = Uuid::new_v4();

    store.emit(&WorkflowEvent::new(
      Uuid::new_v4(),
      execution_id,
      None,
      EventBody::WorkflowResumed {
        workflow_name: "pipeline".to_string(),
      },
    ));
    let mut state =
      State::new(BTreeMap::from([("q".to_string(), json!(1))])).with_span_id(execution_id);
    store.snapshot(&state);
    state.set_field("step", json!(2));
    store.snapshot(&state);

    assert_eq!(store.latest_events(execution_id).await.unwrap().len(), 1);
    let snapshots = store.state_snapshot_history(execution_id).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[1].field("step"), Some(&json!(2)));
  }

  #[tokio::test]
  async fn test_unknown_execution() {
    let store = InMemoryStore::new();
    assert!(matches!(
      store.latest_events(Uuid::new_v4()).await,
      Err(RuntimeError::NotFound(_))
    ));
  }
}
