//! Run-scoped mutable state.
//!
//! A [`State`] holds the workflow inputs, external inputs, published node
//! outputs, user state fields and the [`ExecutionCache`] of one run. Every
//! mutation stamps `updated_at` and hands a deep copy to the snapshot hook, if
//! one is installed. Copies never inherit the hook.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::cache::ExecutionCache;
use crate::error::StateError;
use crate::id::{ExternalInputRef, NodeId};

/// Callback receiving an immutable copy of the state after each mutation.
pub type SnapshotCallback = Arc<dyn Fn(State) + Send + Sync>;

#[derive(Default)]
struct SnapshotHook(Option<SnapshotCallback>);

impl Clone for SnapshotHook {
  // A copy observes nothing until a hook is installed on it explicitly.
  fn clone(&self) -> Self {
    Self(None)
  }
}

impl fmt::Debug for SnapshotHook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(if self.0.is_some() {
      "SnapshotHook(installed)"
    } else {
      "SnapshotHook(none)"
    })
  }
}

/// Keys written since the state was forked.
#[derive(Debug, Clone, Default)]
struct ForkWrites {
  workflow_inputs: BTreeSet<String>,
  external_inputs: BTreeSet<ExternalInputRef>,
  node_outputs: BTreeSet<NodeId>,
  fields: BTreeSet<String>,
}

/// Per-run memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
  id: Uuid,
  trace_id: Uuid,
  span_id: Uuid,
  updated_at: DateTime<Utc>,
  #[serde(default)]
  workflow_inputs: BTreeMap<String, Value>,
  #[serde(default)]
  external_inputs: BTreeMap<NodeId, BTreeMap<String, Value>>,
  #[serde(default)]
  node_outputs: BTreeMap<NodeId, BTreeMap<String, Value>>,
  #[serde(default)]
  fields: BTreeMap<String, Value>,
  #[serde(default)]
  execution_cache: ExecutionCache,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  parent: Option<Box<State>>,
  #[serde(skip)]
  hook: SnapshotHook,
  #[serde(skip)]
  writes: ForkWrites,
}

impl Default for State {
  fn default() -> Self {
    Self::new(BTreeMap::new())
  }
}

impl State {
  /// Create a fresh state for a new run.
  pub fn new(workflow_inputs: BTreeMap<String, Value>) -> Self {
    Self {
      id: Uuid::new_v4(),
      trace_id: Uuid::new_v4(),
      span_id: Uuid::new_v4(),
      updated_at: Utc::now(),
      workflow_inputs,
      external_inputs: BTreeMap::new(),
      node_outputs: BTreeMap::new(),
      fields: BTreeMap::new(),
      execution_cache: ExecutionCache::new(),
      parent: None,
      hook: SnapshotHook::default(),
      writes: ForkWrites::default(),
    }
  }

  pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
    self.trace_id = trace_id;
    self
  }

  pub fn with_span_id(mut self, span_id: Uuid) -> Self {
    self.span_id = span_id;
    self
  }

  pub fn with_parent(mut self, parent: State) -> Self {
    self.parent = Some(Box::new(parent));
    self
  }

  pub fn with_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
    self.fields = fields;
    self
  }

  /// Rehydrate a state from a persisted snapshot.
  pub fn from_json(value: Value) -> Result<Self, StateError> {
    Ok(serde_json::from_value(value)?)
  }

  /// Serialize the state into its persisted form.
  pub fn to_json(&self) -> Result<Value, StateError> {
    Ok(serde_json::to_value(self)?)
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn trace_id(&self) -> Uuid {
    self.trace_id
  }

  pub fn span_id(&self) -> Uuid {
    self.span_id
  }

  pub fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }

  pub fn parent(&self) -> Option<&State> {
    self.parent.as_deref()
  }

  pub fn workflow_inputs(&self) -> &BTreeMap<String, Value> {
    &self.workflow_inputs
  }

  pub fn workflow_input(&self, name: &str) -> Option<&Value> {
    self.workflow_inputs.get(name)
  }

  pub fn external_input(&self, reference: &ExternalInputRef) -> Option<&Value> {
    self
      .external_inputs
      .get(&reference.node)
      .and_then(|inputs| inputs.get(&reference.name))
  }

  pub fn node_outputs(&self) -> &BTreeMap<NodeId, BTreeMap<String, Value>> {
    &self.node_outputs
  }

  pub fn node_output(&self, node: NodeId, name: &str) -> Option<&Value> {
    self
      .node_outputs
      .get(&node)
      .and_then(|outputs| outputs.get(name))
  }

  pub fn fields(&self) -> &BTreeMap<String, Value> {
    &self.fields
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  pub fn execution_cache(&self) -> &ExecutionCache {
    &self.execution_cache
  }

  /// Install the hook that observes every subsequent mutation.
  pub fn on_snapshot(&mut self, callback: SnapshotCallback) {
    self.hook = SnapshotHook(Some(callback));
  }

  pub fn clear_snapshot_hook(&mut self) {
    self.hook = SnapshotHook::default();
  }

  pub fn set_workflow_input(&mut self, name: impl Into<String>, value: Value) {
    let name = name.into();
    self.writes.workflow_inputs.insert(name.clone());
    self.workflow_inputs.insert(name, value);
    self.touch();
  }

  pub fn set_external_input(&mut self, reference: &ExternalInputRef, value: Value) {
    self
      .external_inputs
      .entry(reference.node)
      .or_default()
      .insert(reference.name.clone(), value);
    self.writes.external_inputs.insert(reference.clone());
    self.touch();
  }

  pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
    let name = name.into();
    self.writes.fields.insert(name.clone());
    self.fields.insert(name, value);
    self.touch();
  }

  /// Publish the complete outputs of a node activation.
  ///
  /// The node's previous outputs are replaced as a whole, so outputs a later
  /// activation did not produce are no longer visible.
  pub fn publish_outputs(
    &mut self,
    node: NodeId,
    outputs: impl IntoIterator<Item = (String, Value)>,
  ) {
    self.node_outputs.insert(node, outputs.into_iter().collect());
    self.writes.node_outputs.insert(node);
    self.touch();
  }

  /// Mutate the execution cache and snapshot the result.
  pub fn update_cache<R>(&mut self, update: impl FnOnce(&mut ExecutionCache) -> R) -> R {
    let result = update(&mut self.execution_cache);
    self.touch();
    result
  }

  /// An independent copy for a concurrent or looping branch.
  ///
  /// The fork keeps the identity of the original so it can be merged back,
  /// and records which entries it writes from here on.
  pub fn fork(&self) -> State {
    debug!(state_id = %self.id, "state_forked");
    let mut fork = self.clone();
    fork.writes = ForkWrites::default();
    fork
  }

  /// Fold a forked copy back into this state.
  ///
  /// Only entries the fork wrote after it was forked are copied, with the
  /// fork as the later writer. Entries the fork merely inherited never
  /// overwrite what this state holds now. Execution caches are unioned.
  pub fn merge(&mut self, other: &State) {
    for name in &other.writes.workflow_inputs {
      if let Some(value) = other.workflow_inputs.get(name) {
        self.workflow_inputs.insert(name.clone(), value.clone());
      }
    }
    for reference in &other.writes.external_inputs {
      if let Some(value) = other.external_input(reference) {
        self
          .external_inputs
          .entry(reference.node)
          .or_default()
          .insert(reference.name.clone(), value.clone());
      }
    }
    for node in &other.writes.node_outputs {
      if let Some(outputs) = other.node_outputs.get(node) {
        self.node_outputs.insert(*node, outputs.clone());
      }
    }
    for name in &other.writes.fields {
      if let Some(value) = other.fields.get(name) {
        self.fields.insert(name.clone(), value.clone());
      }
    }
    self.execution_cache.merge(&other.execution_cache);

    self.writes.workflow_inputs.extend(other.writes.workflow_inputs.iter().cloned());
    self.writes.external_inputs.extend(other.writes.external_inputs.iter().cloned());
    self.writes.node_outputs.extend(other.writes.node_outputs.iter().copied());
    self.writes.fields.extend(other.writes.fields.iter().cloned());
    debug!(state_id = %self.id, merged_id = %other.id, "state_merged");
    self.touch();
  }

  fn touch(&mut self) {
    self.updated_at = Utc::now();
    if let Some(callback) = &self.hook.0 {
      callback(self.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use serde_json::json;

  use super::*;

  fn collecting_hook() -> (SnapshotCallback, Arc<Mutex<Vec<State>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: SnapshotCallback = Arc::new(move |snapshot| {
      sink.lock().unwrap().push(snapshot);
    });
    (callback, seen)
  }

  #[test]
  fn test_every_mutation_snapshots() {
    let (callback, seen) = collecting_hook();
    let mut state = State::new(BTreeMap::from([("x".to_string(), json!(1))]));
    state.on_snapshot(callback);

    let node = NodeId::from_name("a");
    state.set_field("counter", json!(1));
    state.publish_outputs(node, [("value".to_string(), json!("done"))]);
    state.update_cache(|cache| cache.fulfill(node, Uuid::new_v4()));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1].node_output(node, "value"), Some(&json!("done")));
    assert_eq!(seen[2].execution_cache().execution_count(node), 1);
  }

  #[test]
  fn test_copy_preserves_outputs_but_not_hook() {
    let (callback, seen) = collecting_hook();
    let node = NodeId::from_name("a");
    let mut state = State::default();
    state.publish_outputs(node, [("value".to_string(), json!([1, 2]))]);
    state.on_snapshot(callback);

    let mut copy = state.clone();
    assert_eq!(copy.node_outputs(), state.node_outputs());

    copy.set_field("only_on_copy", json!(true));
    assert!(seen.lock().unwrap().is_empty());
    assert!(state.field("only_on_copy").is_none());

    state.set_field("on_original", json!(true));
    assert_eq!(seen.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_publish_replaces_previous_outputs() {
    let node = NodeId::from_name("a");
    let mut state = State::default();
    state.publish_outputs(
      node,
      [
        ("first".to_string(), json!(1)),
        ("second".to_string(), json!(2)),
      ],
    );
    state.publish_outputs(node, [("first".to_string(), json!(3))]);

    assert_eq!(state.node_output(node, "first"), Some(&json!(3)));
    assert!(state.node_output(node, "second").is_none());
  }

  #[test]
  fn test_merge_takes_fork_writes() {
    let a = NodeId::from_name("a");
    let b = NodeId::from_name("b");
    let mut state = State::default();
    state.publish_outputs(a, [("value".to_string(), json!("a"))]);
    state.set_field("owner", json!("main"));

    let mut fork = state.fork();
    fork.publish_outputs(b, [("value".to_string(), json!("b"))]);
    fork.set_field("owner", json!("fork"));
    fork.update_cache(|cache| cache.fulfill(b, Uuid::new_v4()));
    state.publish_outputs(a, [("value".to_string(), json!("a2"))]);

    state.merge(&fork);

    assert_eq!(state.node_output(a, "value"), Some(&json!("a2")));
    assert_eq!(state.node_output(b, "value"), Some(&json!("b")));
    assert_eq!(state.field("owner"), Some(&json!("fork")));
    assert_eq!(state.execution_cache().execution_count(b), 1);
  }

  #[test]
  fn test_merge_keeps_writes_made_after_fork() {
    let a = NodeId::from_name("a");
    let external = ExternalInputRef::new(a, "approval");
    let mut state = State::default();
    state.set_field("x", json!(0));
    state.publish_outputs(a, [("value".to_string(), json!("a"))]);

    let mut fork = state.fork();
    fork.set_field("y", json!("fork"));

    state.set_field("x", json!(5));
    state.set_external_input(&external, json!("yes"));
    state.publish_outputs(a, [("value".to_string(), json!("a2"))]);

    state.merge(&fork);

    assert_eq!(state.field("x"), Some(&json!(5)));
    assert_eq!(state.field("y"), Some(&json!("fork")));
    assert_eq!(state.external_input(&external), Some(&json!("yes")));
    assert_eq!(state.node_output(a, "value"), Some(&json!("a2")));
  }

  #[test]
  fn test_nested_fork_writes_reach_the_root() {
    let mut state = State::default();
    let mut outer = state.fork();
    let mut inner = outer.fork();
    inner.set_field("deep", json!(true));

    outer.merge(&inner);
    state.merge(&outer);

    assert_eq!(state.field("deep"), Some(&json!(true)));
  }

  #[test]
  fn test_persisted_form_round_trips() {
    let node = NodeId::from_name("a");
    let external = ExternalInputRef::new(node, "approval");
    let mut state = State::new(BTreeMap::from([("query".to_string(), json!("rust"))]))
      .with_parent(State::default());
    state.set_external_input(&external, json!("yes"));
    state.publish_outputs(node, [("value".to_string(), json!(42))]);

    let json = state.to_json().unwrap();
    for key in [
      "id",
      "traceId",
      "spanId",
      "updatedAt",
      "workflowInputs",
      "externalInputs",
      "nodeOutputs",
      "executionCache",
      "parent",
    ] {
      assert!(json.get(key).is_some(), "missing key {key}");
    }

    let restored = State::from_json(json).unwrap();
    assert_eq!(restored.id(), state.id());
    assert_eq!(restored.external_input(&external), Some(&json!("yes")));
    assert_eq!(restored.node_output(node, "value"), Some(&json!(42)));
    assert!(restored.parent().is_some());
  }
}
