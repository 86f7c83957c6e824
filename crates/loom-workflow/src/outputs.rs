//! Node outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event in the life of a single named output.
///
/// An output is either announced, streaming partial deltas, or fulfilled with
/// its complete value. Only fulfilled values are published into state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Output {
  Initiated { name: String },
  Streaming { name: String, delta: Value },
  Fulfilled { name: String, value: Value },
}

impl Output {
  pub fn initiated(name: impl Into<String>) -> Self {
    Output::Initiated { name: name.into() }
  }

  pub fn streaming(name: impl Into<String>, delta: impl Into<Value>) -> Self {
    Output::Streaming {
      name: name.into(),
      delta: delta.into(),
    }
  }

  pub fn fulfilled(name: impl Into<String>, value: impl Into<Value>) -> Self {
    Output::Fulfilled {
      name: name.into(),
      value: value.into(),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      Output::Initiated { name } | Output::Streaming { name, .. } | Output::Fulfilled { name, .. } => {
        name
      }
    }
  }
}

/// Complete outputs of a node activation, keyed by output name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(BTreeMap<String, Value>);

impl Outputs {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.0.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn to_json(&self) -> Value {
    Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
  }
}

impl IntoIterator for Outputs {
  type Item = (String, Value);
  type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl FromIterator<(String, Value)> for Outputs {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl From<BTreeMap<String, Value>> for Outputs {
  fn from(map: BTreeMap<String, Value>) -> Self {
    Self(map)
  }
}
