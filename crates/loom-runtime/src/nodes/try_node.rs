use std::sync::Arc;

use async_trait::async_trait;
use loom_workflow::{ErrorCode, Node, NodeContext, NodeError, NodeRun, Outputs, Workflow};
use tracing::warn;

/// Runs a workflow and turns its failure into an `error` output.
///
/// On success the nested outputs pass through. On a caught failure the node
/// fulfills with a single `error` output holding `{message, code}`, so ports
/// can branch on `node.output("error").is_defined()`. Cancellation is never
/// caught.
#[derive(Debug, Clone)]
pub struct TryNode {
  workflow: Arc<Workflow>,
  catch: Option<ErrorCode>,
}

impl TryNode {
  pub fn new(workflow: Workflow) -> Self {
    Self {
      workflow: Arc::new(workflow),
      catch: None,
    }
  }

  /// Only catch failures with this code.
  pub fn on_error_code(mut self, code: ErrorCode) -> Self {
    self.catch = Some(code);
    self
  }

  fn catches(&self, code: ErrorCode) -> bool {
    code != ErrorCode::Cancelled && self.catch.is_none_or(|catch| catch == code)
  }
}

#[async_trait]
impl Node for TryNode {
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError> {
    let inputs = ctx.attributes().clone();
    match ctx.run_workflow(&self.workflow, inputs).await {
      Ok(outputs) => Ok(outputs.into()),
      Err(error) if self.catches(error.code) => {
        warn!(
          node_name = %ctx.node_name(),
          code = %error.code,
          error = %error.message,
          "caught nested failure"
        );
        let error = serde_json::to_value(NodeError::from(error))
          .map_err(|e| NodeError::internal(e.to_string()))?;
        Ok(Outputs::new().with("error", error).into())
      }
      Err(error) => Err(error.into()),
    }
  }
}
