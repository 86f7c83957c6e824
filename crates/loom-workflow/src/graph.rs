//! Graph composition.
//!
//! Graphs are built algebraically with `>>`:
//!
//! ```text
//! [a, b] >> merge >> c                       fan-in
//! start >> router >> [
//!   router.port("left") >> left,             conditional branches
//!   router.port("right") >> right,
//! ]
//! start >> step >> [step.port("again") >> start, step.port("done") >> end]
//! ```
//!
//! `lhs >> rhs` connects every terminal port of `lhs` to every entrypoint node
//! of `rhs`. The only exception is a right operand rooted at a port (built from
//! `node.port(..)`) whose node is already a terminal of `lhs`: that operand
//! continues from the node through the named port instead of receiving an
//! edge into it.
//!
//! Composition never fails eagerly. Problems are recorded on the graph and
//! reported by [`Graph::validate`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Shr;

use loom_state::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::node::{NodeRef, PortRef};

/// A specific port of a specific node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId {
  pub node: NodeId,
  pub port: String,
}

impl PortId {
  pub fn new(node: NodeId, port: impl Into<String>) -> Self {
    Self {
      node,
      port: port.into(),
    }
  }
}

/// A connection from a port to a downstream node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
  pub from: PortId,
  pub to: NodeId,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
  /// Every node of the graph, deduplicated by identity.
  nodes: BTreeMap<NodeId, NodeRef>,
  /// Nodes a run starts from, in declaration order.
  entrypoints: Vec<NodeId>,
  /// Entrypoints entered through a specific port rather than the node itself.
  anchored: BTreeSet<NodeId>,
  edges: Vec<Edge>,
  /// Ports the next `>>` continues from.
  terminals: Vec<PortId>,
  /// Composition errors, reported by `validate`.
  errors: Vec<GraphError>,
}

/// Anything that can stand on either side of `>>`.
#[derive(Debug, Clone)]
pub enum GraphOperand {
  Node(NodeRef),
  Port(PortRef),
  Graph(Graph),
  Set(Vec<GraphOperand>),
}

impl GraphOperand {
  pub fn into_graph(self) -> Graph {
    match self {
      GraphOperand::Node(node) => Graph::from_node(&node),
      GraphOperand::Port(port) => Graph::from_port(&port),
      GraphOperand::Graph(graph) => graph,
      GraphOperand::Set(items) => Graph::from_set(items),
    }
  }
}

impl From<NodeRef> for GraphOperand {
  fn from(node: NodeRef) -> Self {
    GraphOperand::Node(node)
  }
}

impl From<&NodeRef> for GraphOperand {
  fn from(node: &NodeRef) -> Self {
    GraphOperand::Node(node.clone())
  }
}

impl From<PortRef> for GraphOperand {
  fn from(port: PortRef) -> Self {
    GraphOperand::Port(port)
  }
}

impl From<&PortRef> for GraphOperand {
  fn from(port: &PortRef) -> Self {
    GraphOperand::Port(port.clone())
  }
}

impl From<Graph> for GraphOperand {
  fn from(graph: Graph) -> Self {
    GraphOperand::Graph(graph)
  }
}

impl<T: Into<GraphOperand>> From<Vec<T>> for GraphOperand {
  fn from(items: Vec<T>) -> Self {
    GraphOperand::Set(items.into_iter().map(Into::into).collect())
  }
}

impl<T: Into<GraphOperand>, const N: usize> From<[T; N]> for GraphOperand {
  fn from(items: [T; N]) -> Self {
    GraphOperand::Set(items.into_iter().map(Into::into).collect())
  }
}

impl Graph {
  /// A graph of one node whose terminals are all of its ports.
  pub fn from_node(node: &NodeRef) -> Self {
    let mut graph = Self::default();
    graph.add_node(node);
    graph.entrypoints.push(node.id());
    graph.terminals = node
      .ports()
      .iter()
      .map(|port| PortId::new(node.id(), port.name()))
      .collect();
    graph
  }

  /// A graph rooted at one port of a node.
  pub fn from_port(port: &PortRef) -> Self {
    let mut graph = Self::default();
    graph.add_node(&port.node);
    graph.entrypoints.push(port.node.id());
    graph.anchored.insert(port.node.id());
    if !port.node.ports().contains(&port.port) {
      graph.errors.push(GraphError::UnknownPort {
        node: port.node.name().to_string(),
        port: port.port.clone(),
      });
    }
    graph.terminals.push(PortId::new(port.node.id(), port.port.clone()));
    graph
  }

  /// A graph of a single edge.
  pub fn from_edge(from: &PortRef, to: &NodeRef) -> Self {
    Self::from_port(from).compose(to)
  }

  /// The union of several operands.
  pub fn from_set<T: Into<GraphOperand>>(items: impl IntoIterator<Item = T>) -> Self {
    let mut graph = Self::default();
    for item in items {
      let other = item.into().into_graph();
      graph.absorb(&other);
      for entrypoint in &other.entrypoints {
        if !graph.entrypoints.contains(entrypoint) {
          graph.entrypoints.push(*entrypoint);
        }
      }
      graph.anchored.extend(other.anchored.iter().copied());
      for terminal in other.terminals {
        if !graph.terminals.contains(&terminal) {
          graph.terminals.push(terminal);
        }
      }
    }
    graph
  }

  /// `self >> rhs`.
  pub fn compose(mut self, rhs: impl Into<GraphOperand>) -> Self {
    let rhs = rhs.into().into_graph();

    if self.entrypoints.is_empty() && self.edges.is_empty() {
      self.errors.push(GraphError::EmptyComposition);
    }

    for entrypoint in &rhs.entrypoints {
      let continues = rhs.anchored.contains(entrypoint)
        && self.terminals.iter().any(|terminal| terminal.node == *entrypoint);
      if continues {
        continue;
      }
      for terminal in self.terminals.clone() {
        self.push_edge(Edge {
          from: terminal,
          to: *entrypoint,
        });
      }
    }

    self.absorb(&rhs);
    self.terminals = rhs.terminals;
    self
  }

  fn add_node(&mut self, node: &NodeRef) {
    match self.nodes.get(&node.id()) {
      Some(existing) if !existing.same_definition(node) => {
        self.errors.push(GraphError::DuplicateIdentity {
          id: node.id().to_string(),
          name: node.name().to_string(),
        });
      }
      Some(_) => {}
      None => {
        self.nodes.insert(node.id(), node.clone());
      }
    }
  }

  fn push_edge(&mut self, edge: Edge) {
    if !self.edges.contains(&edge) {
      self.edges.push(edge);
    }
  }

  /// Merge nodes, edges and recorded errors of `other` into `self`.
  fn absorb(&mut self, other: &Graph) {
    for node in other.nodes.values() {
      self.add_node(node);
    }
    for edge in &other.edges {
      self.push_edge(edge.clone());
    }
    for error in &other.errors {
      if !self.errors.contains(error) {
        self.errors.push(error.clone());
      }
    }
  }

  pub fn entrypoints(&self) -> &[NodeId] {
    &self.entrypoints
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  pub fn terminals(&self) -> &[PortId] {
    &self.terminals
  }

  pub fn node(&self, id: NodeId) -> Option<&NodeRef> {
    self.nodes.get(&id)
  }

  /// Nodes in discovery order: entrypoints first, then along the edge list.
  pub fn nodes(&self) -> Vec<NodeRef> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    let edge_nodes = self
      .edges
      .iter()
      .flat_map(|edge| [edge.from.node, edge.to]);
    for id in self.entrypoints.iter().copied().chain(edge_nodes) {
      if seen.insert(id) {
        if let Some(node) = self.nodes.get(&id) {
          ordered.push(node.clone());
        }
      }
    }
    ordered
  }

  /// Nodes reached through a port.
  pub fn downstream<'a>(&'a self, from: &'a PortId) -> impl Iterator<Item = NodeId> + 'a {
    self
      .edges
      .iter()
      .filter(move |edge| &edge.from == from)
      .map(|edge| edge.to)
  }

  /// Nodes with an edge into `node`.
  pub fn dependencies(&self, node: NodeId) -> BTreeSet<NodeId> {
    self
      .edges
      .iter()
      .filter(|edge| edge.to == node)
      .map(|edge| edge.from.node)
      .collect()
  }

  /// Check the composed graph.
  pub fn validate(&self) -> Result<(), GraphError> {
    if let Some(error) = self.errors.first() {
      return Err(error.clone());
    }
    if self.entrypoints.is_empty() {
      return Err(GraphError::NoEntrypoints);
    }

    for edge in &self.edges {
      if let Some(node) = self.nodes.get(&edge.from.node) {
        if !node.ports().contains(&edge.from.port) {
          return Err(GraphError::UnknownPort {
            node: node.name().to_string(),
            port: edge.from.port.clone(),
          });
        }
      }
    }

    let mut reachable: BTreeSet<NodeId> = self.entrypoints.iter().copied().collect();
    let mut queue: VecDeque<NodeId> = self.entrypoints.iter().copied().collect();
    while let Some(current) = queue.pop_front() {
      for edge in self.edges.iter().filter(|edge| edge.from.node == current) {
        if reachable.insert(edge.to) {
          queue.push_back(edge.to);
        }
      }
    }

    for edge in &self.edges {
      if !reachable.contains(&edge.to) {
        let name = self
          .nodes
          .get(&edge.to)
          .map(|node| node.name().to_string())
          .unwrap_or_else(|| edge.to.to_string());
        return Err(GraphError::Unreachable { node: name });
      }
    }
    Ok(())
  }
}

impl From<NodeRef> for Graph {
  fn from(node: NodeRef) -> Self {
    Graph::from_node(&node)
  }
}

impl From<&NodeRef> for Graph {
  fn from(node: &NodeRef) -> Self {
    Graph::from_node(node)
  }
}

impl<R: Into<GraphOperand>> Shr<R> for Graph {
  type Output = Graph;

  fn shr(self, rhs: R) -> Graph {
    self.compose(rhs)
  }
}

impl<R: Into<GraphOperand>> Shr<R> for NodeRef {
  type Output = Graph;

  fn shr(self, rhs: R) -> Graph {
    Graph::from_node(&self).compose(rhs)
  }
}

impl<R: Into<GraphOperand>> Shr<R> for &NodeRef {
  type Output = Graph;

  fn shr(self, rhs: R) -> Graph {
    Graph::from_node(self).compose(rhs)
  }
}

impl<R: Into<GraphOperand>> Shr<R> for PortRef {
  type Output = Graph;

  fn shr(self, rhs: R) -> Graph {
    Graph::from_port(&self).compose(rhs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::{NodeBuilder, NodeContext};
  use crate::outputs::Outputs;
  use crate::port::{DEFAULT_PORT, Port};
  use loom_state::Expr;

  fn node(name: &str) -> NodeRef {
    NodeBuilder::from_fn(name, |_ctx: NodeContext| async move { Ok(Outputs::new()) }).build()
  }

  fn edge(from: &NodeRef, port: &str, to: &NodeRef) -> Edge {
    Edge {
      from: PortId::new(from.id(), port),
      to: to.id(),
    }
  }

  #[test]
  fn test_single_node_graph() {
    let a = node("a");
    let graph = Graph::from_node(&a);

    assert_eq!(graph.entrypoints(), [a.id()]);
    assert!(graph.edges().is_empty());
    assert_eq!(graph.terminals(), [PortId::new(a.id(), DEFAULT_PORT)]);
    assert_eq!(graph.nodes().len(), 1);
    assert!(graph.validate().is_ok());
  }

  #[test]
  fn test_fan_in_connects_every_terminal() {
    let (a, b, merge, c) = (node("a"), node("b"), node("merge"), node("c"));
    let graph = Graph::from_set([&a, &b]) >> &merge >> &c;

    assert_eq!(graph.entrypoints(), [a.id(), b.id()]);
    assert_eq!(
      graph.edges(),
      [
        edge(&a, DEFAULT_PORT, &merge),
        edge(&b, DEFAULT_PORT, &merge),
        edge(&merge, DEFAULT_PORT, &c),
      ]
    );
    assert_eq!(graph.dependencies(merge.id()), BTreeSet::from([a.id(), b.id()]));
    assert_eq!(graph.terminals(), [PortId::new(c.id(), DEFAULT_PORT)]);
  }

  #[test]
  fn test_port_operands_continue_from_their_node() {
    let router = NodeBuilder::from_fn("router", |_ctx: NodeContext| async move {
      Ok(Outputs::new())
    })
    .port(Port::on_if("left", Expr::constant(true)))
    .port(Port::on_else("right"))
    .build();
    let (start, left, right) = (node("start"), node("left"), node("right"));

    let graph = &start >> &router >> [router.port("left") >> &left, router.port("right") >> &right];

    assert_eq!(
      graph.edges(),
      [
        edge(&start, DEFAULT_PORT, &router),
        edge(&router, "left", &left),
        edge(&router, "right", &right),
      ]
    );
    assert!(graph.validate().is_ok());
  }

  #[test]
  fn test_loops_add_back_edges() {
    let step = NodeBuilder::from_fn("step", |_ctx: NodeContext| async move { Ok(Outputs::new()) })
      .port(Port::on_if("again", Expr::constant(false)))
      .port(Port::on_else("done"))
      .build();
    let (start, end) = (node("start"), node("end"));

    let graph = &start >> &step >> [step.port("again") >> &start, step.port("done") >> &end];

    assert!(graph.edges().contains(&edge(&step, "again", &start)));
    assert_eq!(graph.dependencies(start.id()), BTreeSet::from([step.id()]));
    let names: Vec<String> = graph.nodes().iter().map(|n| n.name().to_string()).collect();
    assert_eq!(names, ["start", "step", "end"]);
    assert!(graph.validate().is_ok());
  }

  #[test]
  fn test_duplicate_edges_collapse() {
    let (a, b) = (node("a"), node("b"));
    let graph = Graph::from_set([&a >> &b, &a >> &b]);
    assert_eq!(graph.edges().len(), 1);
  }

  #[test]
  fn test_empty_composition_is_reported() {
    let a = node("a");
    let graph = Graph::default() >> &a;
    assert_eq!(graph.validate(), Err(GraphError::EmptyComposition));
  }

  #[test]
  fn test_unknown_port_is_reported() {
    let (a, b) = (node("a"), node("b"));
    let graph = a.port("missing") >> &b;
    assert!(matches!(graph.validate(), Err(GraphError::UnknownPort { .. })));
  }

  #[test]
  fn test_duplicate_identity_is_reported() {
    let a = node("same");
    let b = node("same");
    let graph = &a >> &b;
    assert!(matches!(
      graph.validate(),
      Err(GraphError::DuplicateIdentity { .. })
    ));
  }
}
