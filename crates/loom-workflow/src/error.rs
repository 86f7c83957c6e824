//! Error types for node failures, run failures and invalid definitions.
//!
//! [`NodeError`] and [`WorkflowError`] share the serialized `{message, code}`
//! shape, so either converts into the other without loss.

use std::fmt;

use loom_state::ExprError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds carried by node and workflow failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  /// The graph or its ports are malformed.
  InvalidWorkflow,
  /// Required workflow or node inputs are missing or have the wrong type.
  InvalidInputs,
  /// A node produced outputs it did not declare, or left a streamed output
  /// unfinished.
  InvalidOutputs,
  /// The run cannot continue from the state it was given.
  InvalidState,
  /// A descriptor or template failed to resolve.
  InvalidTemplate,
  /// A panic or an engine invariant failure.
  InternalError,
  /// Generic failure of a node body.
  NodeExecution,
  /// An external provider called by a node failed.
  ProviderError,
  /// Raised deliberately by user code.
  UserDefined,
  /// The run was cancelled.
  Cancelled,
}

impl ErrorCode {
  pub fn as_str(self) -> &'static str {
    match self {
      ErrorCode::InvalidWorkflow => "INVALID_WORKFLOW",
      ErrorCode::InvalidInputs => "INVALID_INPUTS",
      ErrorCode::InvalidOutputs => "INVALID_OUTPUTS",
      ErrorCode::InvalidState => "INVALID_STATE",
      ErrorCode::InvalidTemplate => "INVALID_TEMPLATE",
      ErrorCode::InternalError => "INTERNAL_ERROR",
      ErrorCode::NodeExecution => "NODE_EXECUTION",
      ErrorCode::ProviderError => "PROVIDER_ERROR",
      ErrorCode::UserDefined => "USER_DEFINED",
      ErrorCode::Cancelled => "CANCELLED",
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Failure raised by a node body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct NodeError {
  pub message: String,
  pub code: ErrorCode,
}

impl NodeError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code,
    }
  }

  pub fn user_defined(message: impl Into<String>) -> Self {
    Self::new(ErrorCode::UserDefined, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorCode::InternalError, message)
  }
}

impl From<ExprError> for NodeError {
  fn from(e: ExprError) -> Self {
    Self::new(ErrorCode::InvalidTemplate, e.to_string())
  }
}

impl From<PortError> for NodeError {
  fn from(e: PortError) -> Self {
    Self::new(ErrorCode::InvalidWorkflow, e.to_string())
  }
}

/// Failure of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct WorkflowError {
  pub message: String,
  pub code: ErrorCode,
}

impl WorkflowError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code,
    }
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorCode::Cancelled, "Workflow run was cancelled")
  }
}

impl From<NodeError> for WorkflowError {
  fn from(e: NodeError) -> Self {
    Self {
      message: e.message,
      code: e.code,
    }
  }
}

impl From<WorkflowError> for NodeError {
  fn from(e: WorkflowError) -> Self {
    Self {
      message: e.message,
      code: e.code,
    }
  }
}

impl From<GraphError> for WorkflowError {
  fn from(e: GraphError) -> Self {
    Self::new(ErrorCode::InvalidWorkflow, e.to_string())
  }
}

impl From<ExprError> for WorkflowError {
  fn from(e: ExprError) -> Self {
    Self::new(ErrorCode::InvalidTemplate, e.to_string())
  }
}

/// Invalid workflow definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  /// `>>` was applied to a graph with nothing to continue from.
  #[error("cannot compose from a graph with no entrypoints or edges")]
  EmptyComposition,

  /// No node lacks an inbound edge.
  #[error("graph has no entrypoints")]
  NoEntrypoints,

  /// A node cannot be reached from any entrypoint.
  #[error("node '{node}' is not reachable from any entrypoint")]
  Unreachable { node: String },

  /// An edge leaves through a port the node does not declare.
  #[error("edge from node '{node}' references undeclared port '{port}'")]
  UnknownPort { node: String, port: String },

  /// Two different definitions hash to the same node id.
  #[error("node identity {id} is shared by distinct definitions named '{name}'")]
  DuplicateIdentity { id: String, name: String },

  /// An explicit entrypoint is not a node of the graph.
  #[error("entrypoint '{node}' is not part of the graph")]
  UnknownEntrypoint { node: String },
}

/// Invalid conditional port declarations on a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
  #[error("Port conditions must be in the following order: on_if, on_elif, on_else")]
  Order,

  #[error("Ports containing on_elif or on_else must have at least one on_if")]
  MissingIf,

  #[error("Ports containing on_elif must have exactly one on_if")]
  ElifRequiresSingleIf,

  #[error("Ports can only have one on_else")]
  MultipleElse,
}
