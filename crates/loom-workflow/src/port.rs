//! Ports: named, optionally conditional exits of a node.
//!
//! After a node fulfills, its [`PortSet`] decides which ports fire. Edges
//! leaving the fired ports determine which downstream nodes are signalled.
//!
//! Conditional ports follow `on_if* on_elif* on_else?`. A set containing an
//! `on_elif` is single-branch (the first true condition wins). A set of only
//! `on_if` ports is multi-branch (every true `on_if` fires). `on_else` fires
//! when nothing before it did. If no conditional port fires, the
//! unconditional ports fire.

use loom_state::{Descriptor, IntoExpr, State};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, PortError};

/// Name of the port given to nodes that declare none.
pub const DEFAULT_PORT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
  If,
  Elif,
  Else,
}

impl ConditionType {
  fn rank(self) -> u8 {
    match self {
      ConditionType::If => 0,
      ConditionType::Elif => 1,
      ConditionType::Else => 2,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Port {
  name: String,
  condition: Option<Descriptor<bool>>,
  condition_type: Option<ConditionType>,
  fork_state: bool,
}

impl Port {
  /// An unconditional port.
  pub fn default_port(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      condition: None,
      condition_type: None,
      fork_state: false,
    }
  }

  pub fn on_if(name: impl Into<String>, condition: impl IntoExpr) -> Self {
    Self {
      condition: Some(Descriptor::new(condition)),
      condition_type: Some(ConditionType::If),
      ..Self::default_port(name)
    }
  }

  pub fn on_elif(name: impl Into<String>, condition: impl IntoExpr) -> Self {
    Self {
      condition: Some(Descriptor::new(condition)),
      condition_type: Some(ConditionType::Elif),
      ..Self::default_port(name)
    }
  }

  pub fn on_else(name: impl Into<String>) -> Self {
    Self {
      condition_type: Some(ConditionType::Else),
      ..Self::default_port(name)
    }
  }

  /// Downstream activations reached through this port run against a forked
  /// copy of the state, merged back when they fulfill.
  pub fn with_fork_state(mut self, fork_state: bool) -> Self {
    self.fork_state = fork_state;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn condition_type(&self) -> Option<ConditionType> {
    self.condition_type
  }

  pub fn forks_state(&self) -> bool {
    self.fork_state
  }

  fn condition_holds(&self, state: &State) -> Result<bool, NodeError> {
    match &self.condition {
      Some(condition) => Ok(condition.resolve(state)?.unwrap_or(false)),
      None => Ok(false),
    }
  }
}

/// The ports of a single node, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct PortSet {
  ports: Vec<Port>,
}

impl PortSet {
  pub fn new(ports: Vec<Port>) -> Self {
    Self { ports }
  }

  pub fn iter(&self) -> impl Iterator<Item = &Port> {
    self.ports.iter()
  }

  pub fn get(&self, name: &str) -> Option<&Port> {
    self.ports.iter().find(|port| port.name == name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  pub fn is_empty(&self) -> bool {
    self.ports.is_empty()
  }

  /// Check the ordering and arity of conditional ports.
  pub fn validate(&self) -> Result<(), PortError> {
    let conditions: Vec<ConditionType> = self
      .ports
      .iter()
      .filter_map(|port| port.condition_type)
      .collect();

    if conditions
      .windows(2)
      .any(|pair| pair[0].rank() > pair[1].rank())
    {
      return Err(PortError::Order);
    }

    let count = |kind: ConditionType| conditions.iter().filter(|c| **c == kind).count();
    let (ifs, elifs, elses) = (
      count(ConditionType::If),
      count(ConditionType::Elif),
      count(ConditionType::Else),
    );

    if (elifs > 0 || elses > 0) && ifs == 0 {
      return Err(PortError::MissingIf);
    }
    if elifs > 0 && ifs != 1 {
      return Err(PortError::ElifRequiresSingleIf);
    }
    if elses > 1 {
      return Err(PortError::MultipleElse);
    }
    Ok(())
  }

  /// Evaluate which ports fire against the state the node's outputs were
  /// published into.
  pub fn invoked(&self, state: &State) -> Result<Vec<&Port>, NodeError> {
    self.validate()?;

    let single_branch = self
      .ports
      .iter()
      .any(|port| port.condition_type == Some(ConditionType::Elif));

    let mut invoked = Vec::new();
    for port in &self.ports {
      match port.condition_type {
        Some(ConditionType::If) | Some(ConditionType::Elif) => {
          if port.condition_holds(state)? {
            invoked.push(port);
            if single_branch {
              break;
            }
          }
        }
        Some(ConditionType::Else) => {
          if invoked.is_empty() {
            invoked.push(port);
          }
        }
        None => {}
      }
    }

    if invoked.is_empty() {
      invoked = self
        .ports
        .iter()
        .filter(|port| port.condition_type.is_none())
        .collect();
    }
    Ok(invoked)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use loom_state::Expr;
  use serde_json::json;

  use super::*;
  use crate::error::ErrorCode;

  fn state(x: &str) -> State {
    State::new(BTreeMap::from([("x".to_string(), json!(x))]))
  }

  fn names(ports: Vec<&Port>) -> Vec<&str> {
    ports.into_iter().map(Port::name).collect()
  }

  fn if_elif_else() -> PortSet {
    PortSet::new(vec![
      Port::on_if("branch1", Expr::input("x").equals("Hello World!")),
      Port::on_elif("branch2", Expr::input("x").contains("Hello")),
      Port::on_else("branch3"),
    ])
  }

  #[test]
  fn test_single_branch_stops_at_first_true() {
    let ports = if_elif_else();
    assert_eq!(names(ports.invoked(&state("Hello World!")).unwrap()), ["branch1"]);
    assert_eq!(names(ports.invoked(&state("Hello there")).unwrap()), ["branch2"]);
    assert_eq!(names(ports.invoked(&state("Goodbye")).unwrap()), ["branch3"]);
  }

  #[test]
  fn test_multi_branch_fires_every_true_if() {
    let ports = PortSet::new(vec![
      Port::on_if("hello", Expr::input("x").contains("Hello")),
      Port::on_if("world", Expr::input("x").contains("World")),
      Port::on_else("neither"),
    ]);
    assert_eq!(
      names(ports.invoked(&state("Hello World!")).unwrap()),
      ["hello", "world"]
    );
    assert_eq!(names(ports.invoked(&state("nope")).unwrap()), ["neither"]);
  }

  #[test]
  fn test_falls_back_to_default_ports() {
    let ports = PortSet::new(vec![
      Port::on_if("special", Expr::input("x").equals("special")),
      Port::default_port(DEFAULT_PORT),
    ]);
    assert_eq!(names(ports.invoked(&state("plain")).unwrap()), [DEFAULT_PORT]);
    assert_eq!(names(ports.invoked(&state("special")).unwrap()), ["special"]);
  }

  #[test]
  fn test_validation_rejects_bad_declarations() {
    let out_of_order = PortSet::new(vec![
      Port::on_else("else"),
      Port::on_if("if", Expr::constant(true)),
    ]);
    assert_eq!(out_of_order.validate(), Err(PortError::Order));

    let orphan_elif = PortSet::new(vec![Port::on_elif("elif", Expr::constant(true))]);
    assert_eq!(orphan_elif.validate(), Err(PortError::MissingIf));

    let two_ifs_with_elif = PortSet::new(vec![
      Port::on_if("a", Expr::constant(true)),
      Port::on_if("b", Expr::constant(true)),
      Port::on_elif("c", Expr::constant(true)),
    ]);
    assert_eq!(
      two_ifs_with_elif.validate(),
      Err(PortError::ElifRequiresSingleIf)
    );

    let two_elses = PortSet::new(vec![
      Port::on_if("a", Expr::constant(true)),
      Port::on_else("b"),
      Port::on_else("c"),
    ]);
    assert_eq!(two_elses.validate(), Err(PortError::MultipleElse));
  }

  #[test]
  fn test_invalid_ports_surface_on_evaluation() {
    let ports = PortSet::new(vec![Port::on_else("else")]);
    let err = ports.invoked(&state("x")).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidWorkflow);
  }
}
