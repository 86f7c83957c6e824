//! Error types for descriptor resolution and state bookkeeping.

use thiserror::Error;

/// Errors raised while resolving a descriptor against a state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
  /// Two operands cannot be ordered or searched with the given operator.
  #[error("cannot apply '{op}' to {lhs} and {rhs}")]
  InvalidComparison {
    op: &'static str,
    lhs: &'static str,
    rhs: &'static str,
  },

  /// A resolved value does not have the type the descriptor expects.
  #[error("expected {expected}: {message}")]
  TypeMismatch {
    expected: &'static str,
    message: String,
  },

  /// A template failed to render.
  #[error("template error: {message}")]
  Template { message: String },
}

/// Errors raised by state and execution cache bookkeeping.
#[derive(Debug, Error)]
pub enum StateError {
  /// An activation id was initiated a second time.
  #[error("activation {activation} of node {node} was already initiated")]
  AlreadyInitiated { node: String, activation: String },

  /// The persisted form could not be read or written.
  #[error("failed to serialize state: {0}")]
  Serialization(#[from] serde_json::Error),
}
