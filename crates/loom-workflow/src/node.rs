//! The node authoring contract.
//!
//! A node is declared once with [`NodeBuilder`] and referenced through a
//! cheap, clonable [`NodeRef`]. Its body implements [`Node`] and receives a
//! [`NodeContext`] per activation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use loom_state::{ActivationId, Expr, ExternalInputRef, IntoExpr, NodeId, State};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, NodeError, WorkflowError};
use crate::outputs::{Output, Outputs};
use crate::port::{DEFAULT_PORT, Port, PortSet};
use crate::trigger::MergeBehavior;
use crate::workflow::Workflow;

/// What a node body produces.
pub enum NodeRun {
  /// Complete outputs.
  Outputs(Outputs),
  /// A stream of output events. Each named output must end fulfilled.
  Stream(BoxStream<'static, Result<Output, NodeError>>),
}

impl From<Outputs> for NodeRun {
  fn from(outputs: Outputs) -> Self {
    NodeRun::Outputs(outputs)
  }
}

impl fmt::Debug for NodeRun {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NodeRun::Outputs(outputs) => f.debug_tuple("Outputs").field(outputs).finish(),
      NodeRun::Stream(_) => f.write_str("Stream(..)"),
    }
  }
}

/// A unit of work.
#[async_trait]
pub trait Node: Send + Sync {
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError>;
}

/// Adapts an async closure into a [`Node`].
pub struct FnNode<F>(F);

impl<F> FnNode<F> {
  pub fn new(f: F) -> Self {
    Self(f)
  }
}

#[async_trait]
impl<F, Fut, R> Node for FnNode<F>
where
  F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, NodeError>> + Send + 'static,
  R: Into<NodeRun> + Send + 'static,
{
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError> {
    (self.0)(ctx).await.map(Into::into)
  }
}

/// Runs a nested workflow on behalf of a node.
///
/// Implemented by the runtime so composite nodes (subworkflow, map, try,
/// retry) can embed a scheduler without depending on it.
#[async_trait]
pub trait NestedRun: Send + Sync {
  async fn run_nested(
    &self,
    parent: &NodeContext,
    workflow: &Workflow,
    inputs: BTreeMap<String, Value>,
  ) -> Result<Outputs, WorkflowError>;
}

/// A node definition: identity, wiring and body.
pub struct NodeDefinition {
  id: NodeId,
  name: String,
  attributes: BTreeMap<String, Expr>,
  ports: PortSet,
  outputs: Vec<String>,
  merge_behavior: MergeBehavior,
  external_inputs: Vec<String>,
  body: Arc<dyn Node>,
}

impl NodeDefinition {
  pub fn id(&self) -> NodeId {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn attributes(&self) -> &BTreeMap<String, Expr> {
    &self.attributes
  }

  pub fn ports(&self) -> &PortSet {
    &self.ports
  }

  /// Declared output names. Empty means the node's outputs are not checked.
  pub fn output_names(&self) -> &[String] {
    &self.outputs
  }

  pub fn merge_behavior(&self) -> MergeBehavior {
    self.merge_behavior
  }

  pub fn external_input_names(&self) -> &[String] {
    &self.external_inputs
  }

  pub fn body(&self) -> Arc<dyn Node> {
    self.body.clone()
  }

  /// References to the declared external inputs not yet present in state.
  pub fn missing_external_inputs(&self, state: &State) -> Vec<ExternalInputRef> {
    self
      .external_inputs
      .iter()
      .map(|name| ExternalInputRef::new(self.id, name.clone()))
      .filter(|reference| state.external_input(reference).is_none())
      .collect()
  }

  /// Check fulfilled outputs against the declared output names.
  pub fn validate_outputs(&self, outputs: &Outputs) -> Result<(), NodeError> {
    if self.outputs.is_empty() {
      return Ok(());
    }
    if let Some(unknown) = outputs.names().find(|name| !self.outputs.iter().any(|o| o == name)) {
      return Err(NodeError::new(
        ErrorCode::InvalidOutputs,
        format!("Node '{}' produced undeclared output '{}'", self.name, unknown),
      ));
    }
    Ok(())
  }
}

impl fmt::Debug for NodeDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeDefinition")
      .field("id", &self.id)
      .field("name", &self.name)
      .field("ports", &self.ports)
      .field("outputs", &self.outputs)
      .field("merge_behavior", &self.merge_behavior)
      .finish_non_exhaustive()
  }
}

/// Shared handle to a node definition.
#[derive(Debug, Clone)]
pub struct NodeRef(Arc<NodeDefinition>);

impl NodeRef {
  /// Lazy reference to one of this node's outputs.
  pub fn output(&self, name: impl Into<String>) -> Expr {
    Expr::node_output(self.id, name)
  }

  pub fn execution_count(&self) -> Expr {
    Expr::execution_count(self.id)
  }

  pub fn external_input(&self, name: impl Into<String>) -> Expr {
    Expr::external_input(self.id, name)
  }

  pub fn external_input_ref(&self, name: impl Into<String>) -> ExternalInputRef {
    ExternalInputRef::new(self.id, name)
  }

  pub fn port(&self, name: impl Into<String>) -> PortRef {
    PortRef {
      node: self.clone(),
      port: name.into(),
    }
  }

  /// Whether both handles point at the same definition.
  pub fn same_definition(&self, other: &NodeRef) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl Deref for NodeRef {
  type Target = NodeDefinition;

  fn deref(&self) -> &NodeDefinition {
    &self.0
  }
}

/// A named port of a specific node.
#[derive(Debug, Clone)]
pub struct PortRef {
  pub node: NodeRef,
  pub port: String,
}

/// Builder for node definitions.
pub struct NodeBuilder {
  name: String,
  attributes: BTreeMap<String, Expr>,
  ports: Vec<Port>,
  outputs: Vec<String>,
  merge_behavior: MergeBehavior,
  external_inputs: Vec<String>,
  body: Arc<dyn Node>,
}

impl NodeBuilder {
  /// Start a definition. `name` is the qualified name the node's identity is
  /// derived from.
  pub fn new(name: impl Into<String>, body: impl Node + 'static) -> Self {
    Self {
      name: name.into(),
      attributes: BTreeMap::new(),
      ports: Vec::new(),
      outputs: Vec::new(),
      merge_behavior: MergeBehavior::default(),
      external_inputs: Vec::new(),
      body: Arc::new(body),
    }
  }

  pub fn from_fn<F, Fut, R>(name: impl Into<String>, f: F) -> Self
  where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, NodeError>> + Send + 'static,
    R: Into<NodeRun> + Send + 'static,
  {
    Self::new(name, FnNode::new(f))
  }

  pub fn attribute(mut self, name: impl Into<String>, value: impl IntoExpr) -> Self {
    self.attributes.insert(name.into(), value.into_expr());
    self
  }

  pub fn port(mut self, port: Port) -> Self {
    self.ports.push(port);
    self
  }

  pub fn output(mut self, name: impl Into<String>) -> Self {
    self.outputs.push(name.into());
    self
  }

  pub fn trigger(mut self, merge_behavior: MergeBehavior) -> Self {
    self.merge_behavior = merge_behavior;
    self
  }

  pub fn external_input(mut self, name: impl Into<String>) -> Self {
    self.external_inputs.push(name.into());
    self
  }

  pub fn build(self) -> NodeRef {
    let ports = if self.ports.is_empty() {
      vec![Port::default_port(DEFAULT_PORT)]
    } else {
      self.ports
    };
    NodeRef(Arc::new(NodeDefinition {
      id: NodeId::from_name(&self.name),
      name: self.name,
      attributes: self.attributes,
      ports: PortSet::new(ports),
      outputs: self.outputs,
      merge_behavior: self.merge_behavior,
      external_inputs: self.external_inputs,
      body: self.body,
    }))
  }
}

/// Everything a node body sees during one activation.
#[derive(Clone)]
pub struct NodeContext {
  node_id: NodeId,
  node_name: Arc<str>,
  span_id: ActivationId,
  attributes: Arc<BTreeMap<String, Value>>,
  state: Arc<State>,
  cancel: CancellationToken,
  nested: Arc<dyn NestedRun>,
  state_patches: Arc<Mutex<Vec<(String, Value)>>>,
}

impl NodeContext {
  pub fn new(
    node: &NodeDefinition,
    span_id: ActivationId,
    attributes: BTreeMap<String, Value>,
    state: Arc<State>,
    cancel: CancellationToken,
    nested: Arc<dyn NestedRun>,
  ) -> Self {
    Self {
      node_id: node.id(),
      node_name: Arc::from(node.name()),
      span_id,
      attributes: Arc::new(attributes),
      state,
      cancel,
      nested,
      state_patches: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  pub fn node_name(&self) -> &str {
    &self.node_name
  }

  /// The activation id, which is also the node's span id.
  pub fn span_id(&self) -> ActivationId {
    self.span_id
  }

  pub fn trace_id(&self) -> Uuid {
    self.state.trace_id()
  }

  /// Snapshot of the run state taken when the activation launched.
  pub fn state(&self) -> &State {
    &self.state
  }

  pub fn shared_state(&self) -> Arc<State> {
    self.state.clone()
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  pub fn attributes(&self) -> &BTreeMap<String, Value> {
    &self.attributes
  }

  pub fn attribute(&self, name: &str) -> Option<&Value> {
    self.attributes.get(name)
  }

  /// Deserialize a required attribute.
  pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, NodeError> {
    let value = self.attribute(name).ok_or_else(|| {
      NodeError::new(
        ErrorCode::InvalidInputs,
        format!("Node '{}' is missing attribute '{}'", self.node_name, name),
      )
    })?;
    serde_json::from_value(value.clone()).map_err(|e| {
      NodeError::new(
        ErrorCode::InvalidInputs,
        format!(
          "Node '{}' attribute '{}' is invalid: {}",
          self.node_name, name, e
        ),
      )
    })
  }

  /// Deserialize an attribute that may be absent or null.
  pub fn get_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, NodeError> {
    match self.attribute(name) {
      None | Some(Value::Null) => Ok(None),
      Some(_) => self.get(name).map(Some),
    }
  }

  pub fn input(&self, name: &str) -> Option<&Value> {
    self.state.workflow_input(name)
  }

  /// Write a state field. Applied to the run state when the node fulfills.
  pub fn set_state(&self, name: impl Into<String>, value: impl Into<Value>) {
    if let Ok(mut patches) = self.state_patches.lock() {
      patches.push((name.into(), value.into()));
    }
  }

  /// Drain the buffered state writes.
  pub fn take_state_patches(&self) -> Vec<(String, Value)> {
    self
      .state_patches
      .lock()
      .map(|mut patches| std::mem::take(&mut *patches))
      .unwrap_or_default()
  }

  /// Run a workflow nested under this activation and return its outputs.
  pub async fn run_workflow(
    &self,
    workflow: &Workflow,
    inputs: BTreeMap<String, Value>,
  ) -> Result<Outputs, WorkflowError> {
    let nested = self.nested.clone();
    nested.run_nested(self, workflow, inputs).await
  }
}

impl fmt::Debug for NodeContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeContext")
      .field("node_id", &self.node_id)
      .field("node_name", &self.node_name)
      .field("span_id", &self.span_id)
      .field("attributes", &self.attributes)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct NoNesting;

  #[async_trait]
  impl NestedRun for NoNesting {
    async fn run_nested(
      &self,
      _parent: &NodeContext,
      _workflow: &Workflow,
      _inputs: BTreeMap<String, Value>,
    ) -> Result<Outputs, WorkflowError> {
      Err(WorkflowError::new(ErrorCode::InternalError, "nesting disabled"))
    }
  }

  fn context(node: &NodeRef, attributes: BTreeMap<String, Value>) -> NodeContext {
    NodeContext::new(
      node,
      Uuid::new_v4(),
      attributes,
      Arc::new(State::default()),
      CancellationToken::new(),
      Arc::new(NoNesting),
    )
  }

  fn echo() -> NodeRef {
    NodeBuilder::from_fn("tests.Echo", |ctx: NodeContext| async move {
      let text: String = ctx.get("text")?;
      ctx.set_state("last", text.clone());
      Ok::<_, NodeError>(Outputs::new().with("text", text))
    })
    .attribute("text", Expr::input("text"))
    .output("text")
    .build()
  }

  #[test]
  fn test_builder_defaults() {
    let node = echo();
    assert_eq!(node.id(), NodeId::from_name("tests.Echo"));
    assert!(node.ports().contains(DEFAULT_PORT));
    assert_eq!(node.merge_behavior(), MergeBehavior::AwaitAttributes);
    assert_eq!(node.output("text"), Expr::node_output(node.id(), "text"));
  }

  #[tokio::test]
  async fn test_fn_node_runs_with_context() {
    let node = echo();
    let ctx = context(&node, BTreeMap::from([("text".to_string(), json!("hi"))]));

    let run = node.body().run(ctx.clone()).await.unwrap();
    let NodeRun::Outputs(outputs) = run else {
      panic!("expected outputs");
    };
    assert_eq!(outputs.get("text"), Some(&json!("hi")));
    assert_eq!(ctx.take_state_patches(), vec![("last".to_string(), json!("hi"))]);
    assert!(ctx.take_state_patches().is_empty());
  }

  #[tokio::test]
  async fn test_missing_attribute_is_invalid_inputs() {
    let node = echo();
    let err = node.body().run(context(&node, BTreeMap::new())).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInputs);
  }

  #[test]
  fn test_undeclared_output_is_rejected() {
    let node = echo();
    assert!(node.validate_outputs(&Outputs::new().with("text", "ok")).is_ok());
    let err = node
      .validate_outputs(&Outputs::new().with("other", 1))
      .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOutputs);
  }

  #[test]
  fn test_missing_external_inputs() {
    let node = NodeBuilder::from_fn("tests.Approve", |_ctx: NodeContext| async move {
      Ok(Outputs::new())
    })
    .external_input("approval")
    .build();

    let mut state = State::default();
    assert_eq!(
      node.missing_external_inputs(&state),
      vec![node.external_input_ref("approval")]
    );
    state.set_external_input(&node.external_input_ref("approval"), json!(true));
    assert!(node.missing_external_inputs(&state).is_empty());
  }
}
