//! Execution cache: the scheduling ledger of a run.
//!
//! For every node the cache tracks which activations were initiated, a LIFO
//! history of fulfilled activations (whose length is the node's execution
//! count), and the activations still waiting on dependency signals.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;
use crate::id::{ActivationId, NodeId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeExecutions {
  #[serde(default)]
  initiated: BTreeSet<ActivationId>,
  #[serde(default)]
  fulfilled: Vec<ActivationId>,
  #[serde(default)]
  queued: Vec<QueuedActivation>,
}

/// An activation that has been signalled by some, but not all, dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedActivation {
  id: ActivationId,
  invoked_by: BTreeSet<NodeId>,
}

/// Per-node activation ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionCache {
  nodes: BTreeMap<NodeId, NodeExecutions>,
}

impl ExecutionCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue an activation of `node` on behalf of the upstream node `invoked_by`.
  ///
  /// An existing queued activation that has not yet heard from `invoked_by`
  /// absorbs the signal and its id is returned, so concurrent signals from
  /// several edges collapse into one logical activation. Otherwise a new id is
  /// allocated. An activation leaves the queue once every dependency has
  /// signalled it. Without `invoked_by` (entrypoints) a fresh id is returned
  /// and nothing is queued.
  pub fn queue_activation(
    &mut self,
    node: NodeId,
    dependencies: &BTreeSet<NodeId>,
    invoked_by: Option<NodeId>,
  ) -> ActivationId {
    let Some(source) = invoked_by else {
      return Uuid::new_v4();
    };

    let entry = self.nodes.entry(node).or_default();

    if let Some(position) = entry
      .queued
      .iter()
      .position(|queued| !queued.invoked_by.contains(&source))
    {
      let queued = &mut entry.queued[position];
      queued.invoked_by.insert(source);
      let id = queued.id;
      if dependencies.is_subset(&queued.invoked_by) {
        entry.queued.remove(position);
      }
      return id;
    }

    let queued = QueuedActivation {
      id: Uuid::new_v4(),
      invoked_by: BTreeSet::from([source]),
    };
    let id = queued.id;
    if !dependencies.is_subset(&queued.invoked_by) {
      entry.queued.push(queued);
    }
    id
  }

  /// Whether the activation has already been initiated.
  pub fn is_initiated(&self, node: NodeId, activation: ActivationId) -> bool {
    self
      .nodes
      .get(&node)
      .is_some_and(|entry| entry.initiated.contains(&activation))
  }

  /// Mark an activation as initiated. Each id may be initiated once.
  pub fn initiate(&mut self, node: NodeId, activation: ActivationId) -> Result<(), StateError> {
    let entry = self.nodes.entry(node).or_default();
    if !entry.initiated.insert(activation) {
      return Err(StateError::AlreadyInitiated {
        node: node.to_string(),
        activation: activation.to_string(),
      });
    }
    Ok(())
  }

  /// Record a fulfilled activation on the node's history stack.
  pub fn fulfill(&mut self, node: NodeId, activation: ActivationId) {
    self.nodes.entry(node).or_default().fulfilled.push(activation);
  }

  /// Number of fulfilled activations of the node.
  pub fn execution_count(&self, node: NodeId) -> usize {
    self
      .nodes
      .get(&node)
      .map(|entry| entry.fulfilled.len())
      .unwrap_or(0)
  }

  /// Most recently fulfilled activation of the node.
  pub fn last_fulfilled(&self, node: NodeId) -> Option<ActivationId> {
    self
      .nodes
      .get(&node)
      .and_then(|entry| entry.fulfilled.last().copied())
  }

  /// Activations of the node still waiting on dependency signals.
  pub fn queued(&self, node: NodeId) -> Vec<ActivationId> {
    self
      .nodes
      .get(&node)
      .map(|entry| entry.queued.iter().map(|queued| queued.id).collect())
      .unwrap_or_default()
  }

  /// Fold another cache into this one.
  ///
  /// Initiated sets are unioned and fulfilled activations unknown to this
  /// cache are appended, so execution counts never go down.
  pub fn merge(&mut self, other: &ExecutionCache) {
    for (node, theirs) in &other.nodes {
      let ours = self.nodes.entry(*node).or_default();
      ours.initiated.extend(theirs.initiated.iter().copied());
      for activation in &theirs.fulfilled {
        if !ours.fulfilled.contains(activation) {
          ours.fulfilled.push(*activation);
        }
      }
    }
  }
}
