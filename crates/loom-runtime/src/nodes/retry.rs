use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_workflow::{ErrorCode, Node, NodeContext, NodeError, NodeRun, Workflow};
use serde_json::json;
use tracing::warn;

/// Runs a workflow until it succeeds or the attempts are used up.
///
/// Each attempt receives the node's attributes plus `attempt_number`
/// (starting at 1). When all attempts fail the last failure is returned.
#[derive(Debug, Clone)]
pub struct RetryNode {
  workflow: Arc<Workflow>,
  max_attempts: u32,
  retry_on: Option<ErrorCode>,
  delay: Option<Duration>,
}

impl RetryNode {
  pub fn new(workflow: Workflow) -> Self {
    Self {
      workflow: Arc::new(workflow),
      max_attempts: 3,
      retry_on: None,
      delay: None,
    }
  }

  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  /// Only retry failures with this code; others fail immediately.
  pub fn retry_on_error_code(mut self, code: ErrorCode) -> Self {
    self.retry_on = Some(code);
    self
  }

  /// Wait between attempts.
  pub fn delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  fn retries(&self, code: ErrorCode) -> bool {
    code != ErrorCode::Cancelled && self.retry_on.is_none_or(|retry_on| retry_on == code)
  }
}

#[async_trait]
impl Node for RetryNode {
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError> {
    if self.max_attempts < 1 {
      return Err(NodeError::new(
        ErrorCode::InvalidInputs,
        format!("Node '{}' needs at least one attempt", ctx.node_name()),
      ));
    }

    let mut attempt = 1;
    loop {
      let mut inputs = ctx.attributes().clone();
      inputs.insert("attempt_number".to_string(), json!(attempt));

      let error = match ctx.run_workflow(&self.workflow, inputs).await {
        Ok(outputs) => return Ok(outputs.into()),
        Err(error) => error,
      };
      if attempt >= self.max_attempts || !self.retries(error.code) {
        return Err(error.into());
      }

      warn!(
        node_name = %ctx.node_name(),
        attempt,
        max_attempts = self.max_attempts,
        error = %error,
        "attempt failed, retrying"
      );
      if let Some(delay) = self.delay {
        tokio::select! {
          _ = ctx.cancel_token().cancelled() => {
            return Err(NodeError::new(ErrorCode::Cancelled, "Retry cancelled"));
          }
          _ = tokio::time::sleep(delay) => {}
        }
      }
      attempt += 1;
    }
  }
}
