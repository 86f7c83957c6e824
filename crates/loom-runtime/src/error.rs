//! Runtime error types.
//!
//! Failures of a run itself surface as `workflow.execution.rejected` events;
//! these errors cover configuration and history access.

use thiserror::Error;

/// Errors raised outside a run.
#[derive(Debug, Error)]
pub enum RuntimeError {
  /// Runner configuration could not be parsed.
  #[error("invalid runner configuration: {0}")]
  InvalidConfig(#[from] serde_json::Error),

  /// The requested execution is unknown to the history source.
  #[error("execution not found: {0}")]
  NotFound(String),

  /// The history source failed to read or store an execution.
  #[error("history source error: {message}")]
  History { message: String },
}
