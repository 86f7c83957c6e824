//! Join semantics: when a signalled node activation may start.

use std::collections::BTreeSet;

use loom_state::{ActivationId, ExprError, NodeId, State};
use serde::{Deserialize, Serialize};

use crate::node::NodeDefinition;

/// How a node with several upstream dependencies decides to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeBehavior {
  /// Start on the first signal of an activation.
  AwaitAny,
  /// Start once every dependency has reached this node's next generation.
  AwaitAll,
  /// Start once every attribute resolves to a defined value.
  #[default]
  AwaitAttributes,
}

impl MergeBehavior {
  /// Decide whether `activation` of `node` should be initiated now.
  ///
  /// An activation that was already initiated never starts again.
  pub fn should_initiate(
    self,
    node: &NodeDefinition,
    state: &State,
    dependencies: &BTreeSet<NodeId>,
    activation: ActivationId,
  ) -> Result<bool, ExprError> {
    let cache = state.execution_cache();
    if cache.is_initiated(node.id(), activation) {
      return Ok(false);
    }

    match self {
      MergeBehavior::AwaitAny => Ok(true),
      MergeBehavior::AwaitAll => {
        // generation-aware barrier: in a loop, iteration N waits for every
        // dependency's N-th fulfillment
        let generation = cache.execution_count(node.id()) + 1;
        Ok(
          dependencies
            .iter()
            .all(|dependency| cache.execution_count(*dependency) == generation),
        )
      }
      MergeBehavior::AwaitAttributes => {
        for expr in node.attributes().values() {
          if expr.resolve(state)?.is_none() {
            return Ok(false);
          }
        }
        Ok(true)
      }
    }
  }
}
