//! Fan a nested workflow out over a list.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use loom_workflow::{Node, NodeContext, NodeError, NodeRun, Outputs, Workflow};
use serde_json::{Value, json};
use tracing::debug;

/// Runs a workflow once per element of the `items` attribute.
///
/// Each iteration receives `item`, `index` and `items` as inputs. Every
/// output of the nested workflow becomes a list with one entry per item, in
/// item order; iterations that left an output undefined contribute `null`.
/// The first failing iteration fails the node.
#[derive(Debug, Clone)]
pub struct MapNode {
  workflow: Arc<Workflow>,
  concurrency: Option<usize>,
}

impl MapNode {
  pub fn new(workflow: Workflow) -> Self {
    Self {
      workflow: Arc::new(workflow),
      concurrency: None,
    }
  }

  /// Cap the number of iterations running at once. Unbounded by default.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = Some(concurrency);
    self
  }
}

#[async_trait]
impl Node for MapNode {
  async fn run(&self, ctx: NodeContext) -> Result<NodeRun, NodeError> {
    let items: Vec<Value> = ctx.get("items")?;
    let concurrency = self.concurrency.unwrap_or(items.len()).max(1);
    debug!(
      node_name = %ctx.node_name(),
      items = items.len(),
      concurrency,
      "mapping items"
    );

    let ctx = &ctx;
    let all_items = Value::Array(items.clone());
    let results: Vec<Outputs> = stream::iter(items.into_iter().enumerate())
      .map(|(index, item)| {
        let inputs = BTreeMap::from([
          ("item".to_string(), item),
          ("index".to_string(), json!(index)),
          ("items".to_string(), all_items.clone()),
        ]);
        async move {
          ctx
            .run_workflow(&self.workflow, inputs)
            .await
            .map_err(|e| NodeError::new(e.code, format!("Item {index}: {}", e.message)))
        }
      })
      .buffered(concurrency)
      .try_collect()
      .await?;

    let outputs = self
      .workflow
      .output_exprs()
      .keys()
      .map(|name| {
        let values = results
          .iter()
          .map(|outputs| outputs.get(name).cloned().unwrap_or(Value::Null))
          .collect();
        (name.clone(), Value::Array(values))
      })
      .collect::<Outputs>();
    Ok(outputs.into())
  }
}
