//! Node identities and the references that point into a [`State`](crate::State).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a single node activation (also used as its span id).
pub type ActivationId = Uuid;

/// Identity of a node definition.
///
/// Derived from the node's qualified name, so the same definition maps to the
/// same id across runs and processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
  /// Hash a qualified node name into its identity.
  pub fn from_name(qualified_name: &str) -> Self {
    Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, qualified_name.as_bytes()))
  }

  pub fn as_uuid(&self) -> Uuid {
    self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// A named output of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
  pub node: NodeId,
  pub name: String,
}

impl OutputRef {
  pub fn new(node: NodeId, name: impl Into<String>) -> Self {
    Self {
      node,
      name: name.into(),
    }
  }
}

/// An externally supplied input owned by a node.
///
/// A run pauses when a node that declares one of these is ready but the value
/// has not been supplied yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalInputRef {
  pub node: NodeId,
  pub name: String,
}

impl ExternalInputRef {
  pub fn new(node: NodeId, name: impl Into<String>) -> Self {
    Self {
      node,
      name: name.into(),
    }
  }
}
