use std::sync::Arc;

use async_trait::async_trait;
use loom_workflow::{Node, NodeContext, NodeError, NodeRun, Workflow};

/// Runs a workflow with the node's attributes as its inputs.
///
/// The nested workflow's outputs become the node's outputs.
#[derive(Debug, Clone)]
pub struct SubworkflowNode {
  workflow: Arc<Workflow>,
}

impl SubworkflowNode {
  pub fn new(workflow: Workflow) -> Self {
    Self {
      workflow: Arc::new(workflow),
    }
  }
}

#[async_trait]
impl Node for SubworkflowNode {
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError> {
    let inputs = ctx.attributes().clone();
    let outputs = ctx.run_workflow(&self.workflow, inputs).await?;
    Ok(outputs.into())
  }
}
