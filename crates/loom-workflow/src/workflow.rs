//! Workflow definitions.
//!
//! A [`Workflow`] pairs a validated [`Graph`] with the inputs a run must be
//! given and the descriptors that compute its outputs from the final state.

use std::collections::{BTreeMap, BTreeSet};

use loom_state::{Expr, IntoExpr, NodeId, State};
use serde_json::Value;

use crate::error::{ErrorCode, GraphError, WorkflowError};
use crate::graph::Graph;
use crate::node::NodeRef;
use crate::outputs::Outputs;

/// A validated graph plus its input and output contract.
#[derive(Debug, Clone)]
pub struct Workflow {
  name: String,
  graph: Graph,
  /// Inputs a run must supply.
  required_inputs: BTreeSet<String>,
  /// Values used for optional inputs left out of a run.
  input_defaults: BTreeMap<String, Value>,
  /// Workflow outputs, resolved against the state once the run settles.
  outputs: BTreeMap<String, Expr>,
  /// Upstream nodes of every node, across all ports.
  dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Workflow {
  pub fn builder(name: impl Into<String>, graph: impl Into<Graph>) -> WorkflowBuilder {
    WorkflowBuilder::new(name, graph)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  pub fn node(&self, id: NodeId) -> Option<&NodeRef> {
    self.graph.node(id)
  }

  /// Upstream nodes of `node`, used by join decisions.
  pub fn dependencies(&self, node: NodeId) -> BTreeSet<NodeId> {
    self.dependencies.get(&node).cloned().unwrap_or_default()
  }

  pub fn output_exprs(&self) -> &BTreeMap<String, Expr> {
    &self.outputs
  }

  /// Check supplied inputs and fill in defaults.
  pub fn prepare_inputs(
    &self,
    mut inputs: BTreeMap<String, Value>,
  ) -> Result<BTreeMap<String, Value>, WorkflowError> {
    let missing: Vec<&str> = self
      .required_inputs
      .iter()
      .filter(|name| !inputs.contains_key(*name))
      .map(String::as_str)
      .collect();
    if !missing.is_empty() {
      return Err(WorkflowError::new(
        ErrorCode::InvalidInputs,
        format!(
          "Workflow '{}' is missing required inputs: {}",
          self.name,
          missing.join(", ")
        ),
      ));
    }
    for (name, default) in &self.input_defaults {
      inputs
        .entry(name.clone())
        .or_insert_with(|| default.clone());
    }
    Ok(inputs)
  }

  /// Resolve the declared workflow outputs once the run has finished.
  ///
  /// Outputs that are still undefined are omitted.
  pub fn resolve_outputs(&self, state: &State) -> Result<Outputs, WorkflowError> {
    let mut outputs = Outputs::new();
    for (name, expr) in &self.outputs {
      if let Some(value) = expr.resolve(state)? {
        outputs.insert(name.clone(), value);
      }
    }
    Ok(outputs)
  }
}

pub struct WorkflowBuilder {
  name: String,
  graph: Graph,
  required_inputs: BTreeSet<String>,
  input_defaults: BTreeMap<String, Value>,
  outputs: BTreeMap<String, Expr>,
}

impl WorkflowBuilder {
  pub fn new(name: impl Into<String>, graph: impl Into<Graph>) -> Self {
    Self {
      name: name.into(),
      graph: graph.into(),
      required_inputs: BTreeSet::new(),
      input_defaults: BTreeMap::new(),
      outputs: BTreeMap::new(),
    }
  }

  pub fn input(mut self, name: impl Into<String>) -> Self {
    self.required_inputs.insert(name.into());
    self
  }

  pub fn optional_input(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
    self.input_defaults.insert(name.into(), default.into());
    self
  }

  pub fn output(mut self, name: impl Into<String>, value: impl IntoExpr) -> Self {
    self.outputs.insert(name.into(), value.into_expr());
    self
  }

  pub fn build(self) -> Result<Workflow, GraphError> {
    self.graph.validate()?;

    let mut dependencies: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for edge in self.graph.edges() {
      dependencies
        .entry(edge.to)
        .or_default()
        .insert(edge.from.node);
    }

    Ok(Workflow {
      name: self.name,
      graph: self.graph,
      required_inputs: self.required_inputs,
      input_defaults: self.input_defaults,
      outputs: self.outputs,
      dependencies,
    })
  }
}
