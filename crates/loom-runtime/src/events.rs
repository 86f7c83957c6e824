//! Lifecycle events emitted during a run.
//!
//! Every event carries the trace it belongs to, its own span (the run's
//! execution id for workflow events, the activation id for node events) and
//! the lineage of spans that enclose it. Events of nested runs are relayed to
//! the enclosing run, so a single stream can show a whole tree of executions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use loom_state::{ExternalInputRef, NodeId};
use loom_workflow::{NodeError, Output, Outputs, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The span that encloses an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ParentContext {
  Workflow {
    workflow_name: String,
    span_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<ParentContext>>,
  },
  Node {
    node_id: NodeId,
    node_name: String,
    span_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<ParentContext>>,
  },
}

impl ParentContext {
  pub fn span_id(&self) -> Uuid {
    match self {
      ParentContext::Workflow { span_id, .. } | ParentContext::Node { span_id, .. } => *span_id,
    }
  }

  pub fn parent(&self) -> Option<&ParentContext> {
    match self {
      ParentContext::Workflow { parent, .. } | ParentContext::Node { parent, .. } => parent.as_deref(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "body", rename_all_fields = "camelCase")]
pub enum EventBody {
  #[serde(rename = "workflow.execution.initiated")]
  WorkflowInitiated {
    workflow_name: String,
    inputs: BTreeMap<String, Value>,
  },
  #[serde(rename = "workflow.execution.streaming")]
  WorkflowStreaming { workflow_name: String, output: Output },
  #[serde(rename = "workflow.execution.fulfilled")]
  WorkflowFulfilled {
    workflow_name: String,
    outputs: Outputs,
  },
  #[serde(rename = "workflow.execution.rejected")]
  WorkflowRejected {
    workflow_name: String,
    error: WorkflowError,
  },
  #[serde(rename = "workflow.execution.paused")]
  WorkflowPaused {
    workflow_name: String,
    external_inputs: Vec<ExternalInputRef>,
  },
  #[serde(rename = "workflow.execution.resumed")]
  WorkflowResumed { workflow_name: String },
  #[serde(rename = "node.execution.initiated")]
  NodeInitiated {
    node_id: NodeId,
    node_name: String,
    inputs: BTreeMap<String, Value>,
  },
  #[serde(rename = "node.execution.streaming")]
  NodeStreaming {
    node_id: NodeId,
    node_name: String,
    output: Output,
  },
  #[serde(rename = "node.execution.fulfilled")]
  NodeFulfilled {
    node_id: NodeId,
    node_name: String,
    outputs: Outputs,
    invoked_ports: Vec<String>,
  },
  #[serde(rename = "node.execution.rejected")]
  NodeRejected {
    node_id: NodeId,
    node_name: String,
    error: NodeError,
  },
  #[serde(rename = "node.execution.paused")]
  NodePaused {
    node_id: NodeId,
    node_name: String,
    external_inputs: Vec<ExternalInputRef>,
  },
  #[serde(rename = "node.execution.resumed")]
  NodeResumed { node_id: NodeId, node_name: String },
}

impl EventBody {
  pub fn name(&self) -> &'static str {
    match self {
      EventBody::WorkflowInitiated { .. } => "workflow.execution.initiated",
      EventBody::WorkflowStreaming { .. } => "workflow.execution.streaming",
      EventBody::WorkflowFulfilled { .. } => "workflow.execution.fulfilled",
      EventBody::WorkflowRejected { .. } => "workflow.execution.rejected",
      EventBody::WorkflowPaused { .. } => "workflow.execution.paused",
      EventBody::WorkflowResumed { .. } => "workflow.execution.resumed",
      EventBody::NodeInitiated { .. } => "node.execution.initiated",
      EventBody::NodeStreaming { .. } => "node.execution.streaming",
      EventBody::NodeFulfilled { .. } => "node.execution.fulfilled",
      EventBody::NodeRejected { .. } => "node.execution.rejected",
      EventBody::NodePaused { .. } => "node.execution.paused",
      EventBody::NodeResumed { .. } => "node.execution.resumed",
    }
  }

  /// Whether this body ends a run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      EventBody::WorkflowFulfilled { .. }
        | EventBody::WorkflowRejected { .. }
        | EventBody::WorkflowPaused { .. }
    )
  }

  pub fn node_id(&self) -> Option<NodeId> {
    match self {
      EventBody::NodeInitiated { node_id, .. }
      | EventBody::NodeStreaming { node_id, .. }
      | EventBody::NodeFulfilled { node_id, .. }
      | EventBody::NodeRejected { node_id, .. }
      | EventBody::NodePaused { node_id, .. }
      | EventBody::NodeResumed { node_id, .. } => Some(*node_id),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
  pub id: Uuid,
  pub timestamp: DateTime<Utc>,
  pub trace_id: Uuid,
  pub span_id: Uuid,
  #[serde(default)]
  pub parent: Option<ParentContext>,
  #[serde(flatten)]
  pub body: EventBody,
}

impl WorkflowEvent {
  pub fn new(trace_id: Uuid, span_id: Uuid, parent: Option<ParentContext>, body: EventBody) -> Self {
    Self {
      id: Uuid::new_v4(),
      timestamp: Utc::now(),
      trace_id,
      span_id,
      parent,
      body,
    }
  }

  pub fn name(&self) -> &'static str {
    self.body.name()
  }

  pub fn is_terminal(&self) -> bool {
    self.body.is_terminal()
  }

  /// Id of the outermost run this event belongs to.
  ///
  /// Workflow events of a root run are their own execution; everything else
  /// belongs to the outermost workflow span in its lineage.
  pub fn execution_id(&self) -> Uuid {
    let mut execution = self.span_id;
    let mut cursor = self.parent.as_ref();
    while let Some(context) = cursor {
      if let ParentContext::Workflow { span_id, .. } = context {
        execution = *span_id;
      }
      cursor = context.parent();
    }
    execution
  }

  pub fn outputs(&self) -> Option<&Outputs> {
    match &self.body {
      EventBody::WorkflowFulfilled { outputs, .. } | EventBody::NodeFulfilled { outputs, .. } => {
        Some(outputs)
      }
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&WorkflowError> {
    match &self.body {
      EventBody::WorkflowRejected { error, .. } => Some(error),
      _ => None,
    }
  }
}

/// Which events a stream yields.
///
/// Filters are relative to the run that was started: relayed events of
/// nested runs only pass [`EventFilter::All`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
  /// Workflow events of the run only.
  Workflow,
  /// Workflow events of the run and events of its own nodes.
  #[default]
  WorkflowAndNodes,
  /// Everything, including relayed nested runs.
  All,
}

impl EventFilter {
  pub fn accepts(self, event: &WorkflowEvent, execution_id: Uuid) -> bool {
    let own_workflow_event = event.span_id == execution_id && event.body.node_id().is_none();
    match self {
      EventFilter::Workflow => own_workflow_event,
      EventFilter::WorkflowAndNodes => {
        own_workflow_event
          || matches!(
            &event.parent,
            Some(ParentContext::Workflow { span_id, .. }) if *span_id == execution_id
          )
      }
      EventFilter::All => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn node_event(execution_id: Uuid, parent: Option<Box<ParentContext>>) -> WorkflowEvent {
    let node_id = NodeId::from_name("search");
    WorkflowEvent::new(
      Uuid::new_v4(),
      Uuid::new_v4(),
      Some(ParentContext::Workflow {
        workflow_name: "inner".to_string(),
        span_id: execution_id,
        parent,
      }),
      EventBody::NodeResumed {
        node_id,
        node_name: "search".to_string(),
      },
    )
  }

  #[test]
  fn test_event_json_shape() {
    let event = WorkflowEvent::new(
      Uuid::new_v4(),
      Uuid::new_v4(),
      None,
      EventBody::WorkflowFulfilled {
        workflow_name: "pipeline".to_string(),
        outputs: Outputs::new().with("answer", 42),
      },
    );
    let json = serde_json::to_value(&event).unwrap();

    assert_eq!(json["name"], json!("workflow.execution.fulfilled"));
    assert_eq!(json["body"]["workflowName"], json!("pipeline"));
    assert_eq!(json["body"]["outputs"]["answer"], json!(42));
    assert!(json.get("traceId").is_some());
    assert!(json.get("spanId").is_some());
  }

  #[test]
  fn test_execution_id_follows_outermost_workflow() {
    let root = Uuid::new_v4();
    let nested = Uuid::new_v4();
    let lineage = ParentContext::Node {
      node_id: NodeId::from_name("map"),
      node_name: "map".to_string(),
      span_id: Uuid::new_v4(),
      parent: Some(Box::new(ParentContext::Workflow {
        workflow_name: "outer".to_string(),
        span_id: root,
        parent: None,
      })),
    };

    assert_eq!(node_event(root, None).execution_id(), root);
    assert_eq!(
      node_event(nested, Some(Box::new(lineage))).execution_id(),
      root
    );
  }

  #[test]
  fn test_filters_are_relative_to_the_run() {
    let execution_id = Uuid::new_v4();
    let own = node_event(execution_id, None);
    let relayed = node_event(Uuid::new_v4(), None);

    assert!(EventFilter::WorkflowAndNodes.accepts(&own, execution_id));
    assert!(!EventFilter::Workflow.accepts(&own, execution_id));
    assert!(!EventFilter::WorkflowAndNodes.accepts(&relayed, execution_id));
    assert!(EventFilter::All.accepts(&relayed, execution_id));
  }
}
