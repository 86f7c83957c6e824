//! Template rendering for [`Expr::Template`](crate::Expr::Template).
//!
//! Templates are minijinja strings rendered against a context built from the
//! live state:
//! ```json
//! { "inputs": { ... }, "state": { ... }, "<var>": ... }
//! ```
//! `inputs` holds the workflow inputs, `state` the user state fields, and any
//! template variables are bound at the top level (shadowing the two above).

use std::collections::BTreeMap;

use minijinja::{Environment, Value};

use crate::error::ExprError;
use crate::state::State;

/// Render `template` against the state and extra variables.
///
/// A template that is a single `{{ expr }}` yields the JSON value it renders
/// to when that output parses as JSON, so `"{{ count }}"` resolves to a
/// number rather than a string.
pub(crate) fn render(
  template: &str,
  state: &State,
  vars: BTreeMap<String, serde_json::Value>,
) -> Result<serde_json::Value, ExprError> {
  let env = Environment::new();

  let mut context = serde_json::Map::new();
  context.insert(
    "inputs".to_string(),
    serde_json::Value::Object(
      state
        .workflow_inputs()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    ),
  );
  context.insert(
    "state".to_string(),
    serde_json::Value::Object(
      state
        .fields()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    ),
  );
  context.extend(vars);

  let rendered = env
    .render_str(template, Value::from_serialize(&context))
    .map_err(|e| ExprError::Template {
      message: e.to_string(),
    })?;

  if is_pure_template(template) {
    if let Ok(parsed) = serde_json::from_str(&rendered) {
      return Ok(parsed);
    }
  }
  Ok(serde_json::Value::String(rendered))
}

fn is_pure_template(s: &str) -> bool {
  let trimmed = s.trim();
  trimmed.starts_with("{{")
    && trimmed.ends_with("}}")
    && trimmed.matches("{{").count() == 1
    && trimmed.matches("}}").count() == 1
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn state() -> State {
    let mut state = State::new(BTreeMap::from([("name".to_string(), json!("john doe"))]));
    state.set_field("count", json!(3));
    state
  }

  #[test]
  fn test_render_against_inputs_and_state() {
    let rendered = render(
      "Hello {{ inputs.name | title }}, seen {{ state.count }} times",
      &state(),
      BTreeMap::new(),
    )
    .unwrap();
    assert_eq!(rendered, json!("Hello John Doe, seen 3 times"));
  }

  #[test]
  fn test_pure_template_yields_json() {
    let rendered = render("{{ state.count + 1 }}", &state(), BTreeMap::new()).unwrap();
    assert_eq!(rendered, json!(4));
  }

  #[test]
  fn test_vars_are_bound_at_top_level() {
    let vars = BTreeMap::from([("item".to_string(), json!({"title": "loom"}))]);
    let rendered = render("item: {{ item.title }}", &state(), vars).unwrap();
    assert_eq!(rendered, json!("item: loom"));
  }

  #[test]
  fn test_syntax_error_is_reported() {
    let err = render("{{ unclosed", &state(), BTreeMap::new()).unwrap_err();
    assert!(matches!(err, ExprError::Template { .. }));
  }
}
