//! Nested runs started by composite nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use loom_state::State;
use loom_workflow::{ErrorCode, NestedRun, NodeContext, Outputs, Workflow, WorkflowError};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RunnerConfig;
use crate::emitter::EventEmitter;
use crate::events::{EventBody, ParentContext, WorkflowEvent};
use crate::runner::{RunOptions, WorkItem, WorkflowRunner};

/// Runs nested workflows for the nodes of one enclosing run.
pub(crate) struct NestedRunner {
  worker_tx: mpsc::UnboundedSender<WorkItem>,
  emitter: Arc<dyn EventEmitter>,
  config: RunnerConfig,
  lineage: ParentContext,
}

impl NestedRunner {
  pub(crate) fn new(
    worker_tx: mpsc::UnboundedSender<WorkItem>,
    emitter: Arc<dyn EventEmitter>,
    config: RunnerConfig,
    lineage: ParentContext,
  ) -> Self {
    Self {
      worker_tx,
      emitter,
      config,
      lineage,
    }
  }
}

#[async_trait]
impl NestedRun for NestedRunner {
  async fn run_nested(
    &self,
    parent: &NodeContext,
    workflow: &Workflow,
    inputs: BTreeMap<String, Value>,
  ) -> Result<Outputs, WorkflowError> {
    let lineage = ParentContext::Node {
      node_id: parent.node_id(),
      node_name: parent.node_name().to_string(),
      span_id: parent.span_id(),
      parent: Some(Box::new(self.lineage.clone())),
    };
    let relay = RelayEmitter {
      worker_tx: self.worker_tx.clone(),
      emitter: self.emitter.clone(),
    };
    let runner = WorkflowRunner::new(workflow.clone())
      .with_config(self.config.clone())
      .with_emitter(Arc::new(relay))
      .with_parent(lineage);

    let mut options = RunOptions::new()
      .with_inputs(inputs)
      .with_cancel(parent.cancel_token().child_token());
    options.parent_state = Some(parent.state().clone());

    let event = runner.run(options).await;
    match event.body {
      EventBody::WorkflowFulfilled { outputs, .. } => Ok(outputs),
      EventBody::WorkflowRejected { error, .. } => Err(error),
      EventBody::WorkflowPaused { workflow_name, .. } => Err(WorkflowError::new(
        ErrorCode::InvalidState,
        format!("Nested workflow '{workflow_name}' paused; nested workflows cannot await external inputs"),
      )),
      other => Err(WorkflowError::new(
        ErrorCode::InternalError,
        format!("Nested workflow ended with '{}'", other.name()),
      )),
    }
  }
}

/// Routes a nested run's events through the enclosing run's consumer.
///
/// Snapshots bypass the consumer and go straight to the root emitter.
struct RelayEmitter {
  worker_tx: mpsc::UnboundedSender<WorkItem>,
  emitter: Arc<dyn EventEmitter>,
}

impl EventEmitter for RelayEmitter {
  fn emit(&self, event: &WorkflowEvent) {
    // Ignore send errors - the enclosing run may already be over
    let _ = self.worker_tx.send(WorkItem::Relay(event.clone()));
  }

  fn snapshot(&self, state: &State) {
    self.emitter.snapshot(state);
  }
}
