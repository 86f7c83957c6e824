//! Lazy descriptors resolved against a [`State`].
//!
//! An [`Expr`] describes where a value comes from (a constant, a workflow
//! input, another node's output, a state field, ...) or how to combine other
//! descriptors. Nothing is read until [`Expr::resolve`] walks the expression
//! against a concrete state.
//!
//! Resolution distinguishes *undefined* (`Ok(None)`, the referenced value does
//! not exist yet) from JSON `null`. Readiness checks depend on that
//! distinction: a node whose attribute is still undefined is not ready.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ExprError;
use crate::id::{ExternalInputRef, NodeId, OutputRef};
use crate::state::State;
use crate::template;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Equals,
  DoesNotEqual,
  LessThan,
  LessThanOrEqualTo,
  GreaterThan,
  GreaterThanOrEqualTo,
  Contains,
}

impl CompareOp {
  pub fn symbol(self) -> &'static str {
    match self {
      CompareOp::Equals => "==",
      CompareOp::DoesNotEqual => "!=",
      CompareOp::LessThan => "<",
      CompareOp::LessThanOrEqualTo => "<=",
      CompareOp::GreaterThan => ">",
      CompareOp::GreaterThanOrEqualTo => ">=",
      CompareOp::Contains => "contains",
    }
  }
}

/// A lazy expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Constant(Value),
  /// A workflow input by name.
  Input(String),
  NodeOutput(OutputRef),
  /// Number of fulfilled activations of a node.
  ExecutionCount(NodeId),
  ExternalInput(ExternalInputRef),
  StateField(String),
  Compare(CompareOp, Box<Expr>, Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
  Not(Box<Expr>),
  /// The left side unless it is undefined.
  Coalesce(Box<Expr>, Box<Expr>),
  IsDefined(Box<Expr>),
  /// True when the operand is `null` or undefined.
  IsNull(Box<Expr>),
  Template {
    template: String,
    vars: BTreeMap<String, Expr>,
  },
  Array(Vec<Expr>),
  Object(BTreeMap<String, Expr>),
}

impl Expr {
  pub fn constant(value: impl Into<Value>) -> Self {
    Expr::Constant(value.into())
  }

  pub fn input(name: impl Into<String>) -> Self {
    Expr::Input(name.into())
  }

  pub fn state_field(name: impl Into<String>) -> Self {
    Expr::StateField(name.into())
  }

  pub fn node_output(node: NodeId, name: impl Into<String>) -> Self {
    Expr::NodeOutput(OutputRef::new(node, name))
  }

  pub fn execution_count(node: NodeId) -> Self {
    Expr::ExecutionCount(node)
  }

  pub fn external_input(node: NodeId, name: impl Into<String>) -> Self {
    Expr::ExternalInput(ExternalInputRef::new(node, name))
  }

  pub fn template(template: impl Into<String>) -> Self {
    Expr::Template {
      template: template.into(),
      vars: BTreeMap::new(),
    }
  }

  /// A template with extra variables, each resolved before rendering.
  pub fn template_with<K, V>(template: impl Into<String>, vars: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: IntoExpr,
  {
    Expr::Template {
      template: template.into(),
      vars: vars
        .into_iter()
        .map(|(k, v)| (k.into(), v.into_expr()))
        .collect(),
    }
  }

  pub fn array(items: impl IntoIterator<Item = impl IntoExpr>) -> Self {
    Expr::Array(items.into_iter().map(IntoExpr::into_expr).collect())
  }

  pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, impl IntoExpr)>) -> Self {
    Expr::Object(
      entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into_expr()))
        .collect(),
    )
  }

  fn comparison(self, op: CompareOp, other: impl IntoExpr) -> Self {
    Expr::Compare(op, Box::new(self), Box::new(other.into_expr()))
  }

  pub fn equals(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::Equals, other)
  }

  pub fn does_not_equal(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::DoesNotEqual, other)
  }

  pub fn less_than(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::LessThan, other)
  }

  pub fn less_than_or_equal_to(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::LessThanOrEqualTo, other)
  }

  pub fn greater_than(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::GreaterThan, other)
  }

  pub fn greater_than_or_equal_to(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::GreaterThanOrEqualTo, other)
  }

  pub fn contains(self, other: impl IntoExpr) -> Self {
    self.comparison(CompareOp::Contains, other)
  }

  pub fn and(self, other: impl IntoExpr) -> Self {
    Expr::And(Box::new(self), Box::new(other.into_expr()))
  }

  pub fn or(self, other: impl IntoExpr) -> Self {
    Expr::Or(Box::new(self), Box::new(other.into_expr()))
  }

  pub fn coalesce(self, fallback: impl IntoExpr) -> Self {
    Expr::Coalesce(Box::new(self), Box::new(fallback.into_expr()))
  }

  pub fn is_defined(self) -> Self {
    Expr::IsDefined(Box::new(self))
  }

  pub fn is_null(self) -> Self {
    Expr::IsNull(Box::new(self))
  }

  /// Resolve the expression against a state.
  ///
  /// Returns `Ok(None)` when the expression refers to a value that does not
  /// exist yet. Undefined leaves inside arrays and objects become `null`.
  pub fn resolve(&self, state: &State) -> Result<Option<Value>, ExprError> {
    match self {
      Expr::Constant(value) => Ok(Some(value.clone())),
      Expr::Input(name) => Ok(state.workflow_input(name).cloned()),
      Expr::NodeOutput(output) => Ok(state.node_output(output.node, &output.name).cloned()),
      Expr::ExecutionCount(node) => Ok(Some(Value::from(
        state.execution_cache().execution_count(*node),
      ))),
      Expr::ExternalInput(reference) => Ok(state.external_input(reference).cloned()),
      Expr::StateField(name) => Ok(state.field(name).cloned()),
      Expr::Compare(op, lhs, rhs) => {
        let lhs = lhs.resolve(state)?;
        let rhs = rhs.resolve(state)?;
        compare(*op, lhs.as_ref(), rhs.as_ref()).map(|b| Some(Value::Bool(b)))
      }
      Expr::And(lhs, rhs) => {
        let result = truthy(lhs.resolve(state)?.as_ref()) && truthy(rhs.resolve(state)?.as_ref());
        Ok(Some(Value::Bool(result)))
      }
      Expr::Or(lhs, rhs) => {
        let result = truthy(lhs.resolve(state)?.as_ref()) || truthy(rhs.resolve(state)?.as_ref());
        Ok(Some(Value::Bool(result)))
      }
      Expr::Not(operand) => Ok(Some(Value::Bool(!truthy(
        operand.resolve(state)?.as_ref(),
      )))),
      Expr::Coalesce(lhs, rhs) => match lhs.resolve(state)? {
        Some(value) => Ok(Some(value)),
        None => rhs.resolve(state),
      },
      Expr::IsDefined(operand) => Ok(Some(Value::Bool(operand.resolve(state)?.is_some()))),
      Expr::IsNull(operand) => Ok(Some(Value::Bool(matches!(
        operand.resolve(state)?,
        None | Some(Value::Null)
      )))),
      Expr::Template { template, vars } => {
        let mut resolved = BTreeMap::new();
        for (name, var) in vars {
          resolved.insert(name.clone(), var.resolve(state)?.unwrap_or(Value::Null));
        }
        template::render(template, state, resolved).map(Some)
      }
      Expr::Array(items) => {
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
          resolved.push(item.resolve(state)?.unwrap_or(Value::Null));
        }
        Ok(Some(Value::Array(resolved)))
      }
      Expr::Object(entries) => {
        let mut resolved = serde_json::Map::new();
        for (key, entry) in entries {
          resolved.insert(key.clone(), entry.resolve(state)?.unwrap_or(Value::Null));
        }
        Ok(Some(Value::Object(resolved)))
      }
    }
  }
}

impl std::ops::Not for Expr {
  type Output = Expr;

  fn not(self) -> Expr {
    Expr::Not(Box::new(self))
  }
}

fn truthy(value: Option<&Value>) -> bool {
  match value {
    None | Some(Value::Null) => false,
    Some(Value::Bool(b)) => *b,
    Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
    Some(Value::String(s)) => !s.is_empty(),
    Some(Value::Array(items)) => !items.is_empty(),
    Some(Value::Object(entries)) => !entries.is_empty(),
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
  match (lhs, rhs) {
    // 1 and 1.0 are equal
    (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
    _ => lhs == rhs,
  }
}

fn compare(op: CompareOp, lhs: Option<&Value>, rhs: Option<&Value>) -> Result<bool, ExprError> {
  let (lhs, rhs) = match (lhs, rhs) {
    (Some(lhs), Some(rhs)) => (lhs, rhs),
    // an undefined operand only satisfies inequality
    _ => return Ok(op == CompareOp::DoesNotEqual),
  };

  let invalid = || ExprError::InvalidComparison {
    op: op.symbol(),
    lhs: type_name(lhs),
    rhs: type_name(rhs),
  };

  match op {
    CompareOp::Equals => Ok(values_equal(lhs, rhs)),
    CompareOp::DoesNotEqual => Ok(!values_equal(lhs, rhs)),
    CompareOp::Contains => match (lhs, rhs) {
      (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
      (Value::Array(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
      (Value::Object(entries), Value::String(key)) => Ok(entries.contains_key(key)),
      _ => Err(invalid()),
    },
    CompareOp::LessThan
    | CompareOp::LessThanOrEqualTo
    | CompareOp::GreaterThan
    | CompareOp::GreaterThanOrEqualTo => {
      let ordering = match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
          (Some(l), Some(r)) => l.partial_cmp(&r),
          _ => None,
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => return Err(invalid()),
      };
      let Some(ordering) = ordering else {
        return Ok(false);
      };
      Ok(match op {
        CompareOp::LessThan => ordering.is_lt(),
        CompareOp::LessThanOrEqualTo => ordering.is_le(),
        CompareOp::GreaterThan => ordering.is_gt(),
        _ => ordering.is_ge(),
      })
    }
  }
}

/// Conversion into an [`Expr`], used by the builder methods so plain values
/// can stand in for constants.
pub trait IntoExpr {
  fn into_expr(self) -> Expr;
}

impl IntoExpr for Expr {
  fn into_expr(self) -> Expr {
    self
  }
}

impl IntoExpr for &Expr {
  fn into_expr(self) -> Expr {
    self.clone()
  }
}

impl IntoExpr for Value {
  fn into_expr(self) -> Expr {
    Expr::Constant(self)
  }
}

macro_rules! constant_into_expr {
  ($($ty:ty),*) => {
    $(
      impl IntoExpr for $ty {
        fn into_expr(self) -> Expr {
          Expr::Constant(Value::from(self))
        }
      }
    )*
  };
}

constant_into_expr!(&str, String, bool, i32, i64, u32, u64, usize, f64);

impl<T> IntoExpr for Descriptor<T> {
  fn into_expr(self) -> Expr {
    self.expr
  }
}

/// A typed view over an [`Expr`].
///
/// Resolving deserializes the resolved value into `T`. Both undefined and
/// `null` resolve to `None`.
pub struct Descriptor<T> {
  expr: Expr,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Descriptor<T> {
  pub fn new(expr: impl IntoExpr) -> Self {
    Self {
      expr: expr.into_expr(),
      _marker: PhantomData,
    }
  }

  pub fn expr(&self) -> &Expr {
    &self.expr
  }
}

impl<T: DeserializeOwned> Descriptor<T> {
  pub fn resolve(&self, state: &State) -> Result<Option<T>, ExprError> {
    match self.expr.resolve(state)? {
      None | Some(Value::Null) => Ok(None),
      Some(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ExprError::TypeMismatch {
          expected: std::any::type_name::<T>(),
          message: e.to_string(),
        }),
    }
  }
}

impl<T> From<Expr> for Descriptor<T> {
  fn from(expr: Expr) -> Self {
    Self::new(expr)
  }
}

impl<T> Clone for Descriptor<T> {
  fn clone(&self) -> Self {
    Self {
      expr: self.expr.clone(),
      _marker: PhantomData,
    }
  }
}

impl<T> fmt::Debug for Descriptor<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Descriptor").field(&self.expr).finish()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn state() -> State {
    let mut state = State::new(BTreeMap::from([
      ("x".to_string(), json!("Hello World!")),
      ("limit".to_string(), json!(3)),
    ]));
    state.publish_outputs(
      NodeId::from_name("search"),
      [("results".to_string(), json!(["a", "b"]))],
    );
    state.set_field("flag", json!(null));
    state
  }

  #[test]
  fn test_references_resolve_or_stay_undefined() {
    let state = state();
    let search = NodeId::from_name("search");

    assert_eq!(Expr::input("x").resolve(&state).unwrap(), Some(json!("Hello World!")));
    assert_eq!(Expr::input("missing").resolve(&state).unwrap(), None);
    assert_eq!(
      Expr::node_output(search, "results").resolve(&state).unwrap(),
      Some(json!(["a", "b"]))
    );
    assert_eq!(Expr::node_output(search, "other").resolve(&state).unwrap(), None);
    assert_eq!(Expr::execution_count(search).resolve(&state).unwrap(), Some(json!(0)));
  }

  #[test]
  fn test_comparisons() {
    let state = state();
    let check = |expr: Expr| expr.resolve(&state).unwrap();

    assert_eq!(check(Expr::input("x").equals("Hello World!")), Some(json!(true)));
    assert_eq!(check(Expr::input("limit").equals(3.0)), Some(json!(true)));
    assert_eq!(check(Expr::input("limit").less_than(5)), Some(json!(true)));
    assert_eq!(check(Expr::input("limit").greater_than_or_equal_to(4)), Some(json!(false)));
    assert_eq!(check(Expr::input("x").contains("World")), Some(json!(true)));
    assert_eq!(
      check(Expr::node_output(NodeId::from_name("search"), "results").contains("b")),
      Some(json!(true))
    );
  }

  #[test]
  fn test_undefined_operands_only_satisfy_inequality() {
    let state = state();
    let missing = || Expr::input("missing");

    assert_eq!(missing().equals(1).resolve(&state).unwrap(), Some(json!(false)));
    assert_eq!(missing().less_than(1).resolve(&state).unwrap(), Some(json!(false)));
    assert_eq!(missing().does_not_equal(1).resolve(&state).unwrap(), Some(json!(true)));
  }

  #[test]
  fn test_ordering_mismatched_types_is_an_error() {
    let err = Expr::input("x").less_than(1).resolve(&state()).unwrap_err();
    assert_eq!(
      err,
      ExprError::InvalidComparison {
        op: "<",
        lhs: "string",
        rhs: "number",
      }
    );
  }

  #[test]
  fn test_boolean_combinators_use_truthiness() {
    let state = state();
    let both = Expr::input("x").and(Expr::input("limit"));
    let either = Expr::input("missing").or(Expr::constant(0));
    let negated = !Expr::input("missing");

    assert_eq!(both.resolve(&state).unwrap(), Some(json!(true)));
    assert_eq!(either.resolve(&state).unwrap(), Some(json!(false)));
    assert_eq!(negated.resolve(&state).unwrap(), Some(json!(true)));
  }

  #[test]
  fn test_coalesce_only_replaces_undefined() {
    let state = state();
    assert_eq!(
      Expr::input("missing").coalesce("fallback").resolve(&state).unwrap(),
      Some(json!("fallback"))
    );
    assert_eq!(
      Expr::state_field("flag").coalesce("fallback").resolve(&state).unwrap(),
      Some(json!(null))
    );
    assert_eq!(
      Expr::state_field("flag").is_null().resolve(&state).unwrap(),
      Some(json!(true))
    );
    assert_eq!(
      Expr::state_field("flag").is_defined().resolve(&state).unwrap(),
      Some(json!(true))
    );
  }

  #[test]
  fn test_containers_rebuild_with_null_leaves() {
    let expr = Expr::object([
      ("query", Expr::input("x")),
      ("missing", Expr::input("missing")),
      ("nested", Expr::array([Expr::input("limit"), Expr::constant("literal")])),
    ]);
    assert_eq!(
      expr.resolve(&state()).unwrap(),
      Some(json!({
        "query": "Hello World!",
        "missing": null,
        "nested": [3, "literal"],
      }))
    );
  }

  #[test]
  fn test_template_with_resolved_vars() {
    let expr = Expr::template_with(
      "{{ inputs.x }} ({{ count }} results)",
      [("count", Expr::constant(2))],
    );
    assert_eq!(
      expr.resolve(&state()).unwrap(),
      Some(json!("Hello World! (2 results)"))
    );
  }

  #[test]
  fn test_descriptor_deserializes() {
    let state = state();
    let limit: Descriptor<u32> = Expr::input("limit").into();
    let flag: Descriptor<bool> = Expr::state_field("flag").into();
    let wrong: Descriptor<u32> = Expr::input("x").into();

    assert_eq!(limit.resolve(&state).unwrap(), Some(3));
    assert_eq!(flag.resolve(&state).unwrap(), None);
    assert!(matches!(
      wrong.resolve(&state),
      Err(ExprError::TypeMismatch { .. })
    ));
  }
}
