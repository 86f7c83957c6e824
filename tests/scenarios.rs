//! End-to-end scenarios through the public `loom` API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use loom::{
  ErrorCode, EventBody, EventFilter, Expr, Graph, MapNode, MergeBehavior, NodeBuilder,
  NodeContext, NodeError, NodeId, NodeRef, Outputs, Port, RunOptions, Workflow, WorkflowEvent,
  WorkflowRunner,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn counting(name: &str, runs: Arc<AtomicUsize>) -> NodeRef {
  NodeBuilder::from_fn(name, move |_ctx: NodeContext| {
    runs.fetch_add(1, Ordering::SeqCst);
    async move { Ok(Outputs::new().with("done", true)) }
  })
  .build()
}

fn initiated_count(events: &[WorkflowEvent], node_name: &str) -> usize {
  events
    .iter()
    .filter(|e| matches!(&e.body, EventBody::NodeInitiated { node_name: name, .. } if name == node_name))
    .count()
}

#[tokio::test]
async fn test_await_all_merge_runs_once() {
  let merge_runs = Arc::new(AtomicUsize::new(0));
  let tail_runs = Arc::new(AtomicUsize::new(0));
  let a = counting("a", Arc::new(AtomicUsize::new(0)));
  let b = counting("b", Arc::new(AtomicUsize::new(0)));
  let merge = NodeBuilder::from_fn("merge", {
    let merge_runs = merge_runs.clone();
    move |_ctx: NodeContext| {
      merge_runs.fetch_add(1, Ordering::SeqCst);
      async move { Ok(Outputs::new()) }
    }
  })
  .trigger(MergeBehavior::AwaitAll)
  .build();
  let c = counting("c", tail_runs.clone());

  let workflow = Workflow::builder("fan_in", Graph::from_set([&a, &b]) >> &merge >> &c)
    .build()
    .unwrap();
  let events: Vec<WorkflowEvent> = WorkflowRunner::new(workflow)
    .stream(RunOptions::new(), EventFilter::WorkflowAndNodes, None)
    .collect()
    .await;

  assert_eq!(events.last().unwrap().name(), "workflow.execution.fulfilled");
  assert_eq!(merge_runs.load(Ordering::SeqCst), 1);
  assert_eq!(initiated_count(&events, "merge"), 1);
  assert_eq!(tail_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_if_elif_else_fires_first_matching_branch() {
  let x = Expr::node_output(NodeId::from_name("router"), "x");
  let router = NodeBuilder::from_fn("router", |ctx: NodeContext| async move {
    let x: String = ctx.get("x")?;
    Ok::<_, NodeError>(Outputs::new().with("x", x))
  })
  .attribute("x", Expr::input("x"))
  .port(Port::on_if("branch1", x.clone().equals("Hello World!")))
  .port(Port::on_elif("branch2", x.equals("Goodbye")))
  .port(Port::on_else("branch3"))
  .build();

  let runs: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  let branch1 = counting("branch1", runs[0].clone());
  let branch2 = counting("branch2", runs[1].clone());
  let branch3 = counting("branch3", runs[2].clone());

  let workflow = Workflow::builder(
    "router",
    &router
      >> [
        router.port("branch1") >> &branch1,
        router.port("branch2") >> &branch2,
        router.port("branch3") >> &branch3,
      ],
  )
  .input("x")
  .build()
  .unwrap();
  let events: Vec<WorkflowEvent> = WorkflowRunner::new(workflow)
    .stream(
      RunOptions::new().with_input("x", "Hello World!"),
      EventFilter::WorkflowAndNodes,
      None,
    )
    .collect()
    .await;

  assert_eq!(events.last().unwrap().name(), "workflow.execution.fulfilled");
  let invoked = events
    .iter()
    .find_map(|e| match &e.body {
      EventBody::NodeFulfilled {
        node_name,
        invoked_ports,
        ..
      } if node_name == "router" => Some(invoked_ports.clone()),
      _ => None,
    })
    .unwrap();
  assert_eq!(invoked, vec!["branch1".to_string()]);
  assert_eq!(runs[0].load(Ordering::SeqCst), 1);
  assert_eq!(runs[1].load(Ordering::SeqCst), 0);
  assert_eq!(runs[2].load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_loop_runs_until_condition_fails() {
  const ROUNDS: u64 = 4;
  let start_id = NodeId::from_name("start");

  let start = NodeBuilder::from_fn("start", |ctx: NodeContext| async move {
    let previous: u64 = ctx.get("previous")?;
    Ok::<_, NodeError>(Outputs::new().with("count", previous + 1))
  })
  .attribute("previous", Expr::execution_count(start_id))
  .build();
  let check = NodeBuilder::from_fn("loop", |_ctx: NodeContext| async move { Ok(Outputs::new()) })
    .port(Port::on_if(
      "again",
      Expr::node_output(start_id, "count").less_than(ROUNDS),
    ))
    .port(Port::on_else("exit"))
    .build();
  let end = NodeBuilder::from_fn("end", |ctx: NodeContext| async move {
    let seen: u64 = ctx.get("count")?;
    Ok::<_, NodeError>(Outputs::new().with("seen", seen))
  })
  .attribute("count", start.output("count"))
  .build();

  let workflow = Workflow::builder(
    "loop",
    &start >> &check >> [check.port("again") >> &start, check.port("exit") >> &end],
  )
  .output("seen", end.output("seen"))
  .output("start_runs", start.execution_count())
  .build()
  .unwrap();
  let event = WorkflowRunner::new(workflow).run(RunOptions::new()).await;

  let EventBody::WorkflowFulfilled { outputs, .. } = &event.body else {
    panic!("expected fulfilled, got {}", event.name());
  };
  assert_eq!(outputs.get("seen"), Some(&json!(ROUNDS)));
  assert_eq!(outputs.get("start_runs"), Some(&json!(ROUNDS)));
}

#[tokio::test]
async fn test_user_error_rejects_run() {
  let explode = NodeBuilder::from_fn("explode", |_ctx: NodeContext| async move {
    Err::<Outputs, _>(NodeError::user_defined("X"))
  })
  .build();
  let workflow = Workflow::builder("explode", &explode).build().unwrap();

  let event = WorkflowRunner::new(workflow).run(RunOptions::new()).await;

  assert_eq!(event.name(), "workflow.execution.rejected");
  let error = event.error().unwrap();
  assert_eq!(error.code, ErrorCode::UserDefined);
  assert_eq!(error.message, "X");
}

#[tokio::test]
async fn test_map_runs_items_concurrently() {
  let sleepy = NodeBuilder::from_fn("sleepy", |ctx: NodeContext| async move {
    tokio::time::sleep(Duration::from_millis(30)).await;
    Ok(Outputs::new().with("item", ctx.input("item").cloned().unwrap_or_default()))
  })
  .build();
  let per_item = Workflow::builder("per_item", &sleepy)
    .input("item")
    .output("item", sleepy.output("item"))
    .build()
    .unwrap();
  let map = NodeBuilder::new("map", MapNode::new(per_item))
    .attribute("items", Expr::input("items"))
    .build();
  let workflow = Workflow::builder("map", &map)
    .input("items")
    .output("items", map.output("item"))
    .build()
    .unwrap();

  let started = Instant::now();
  let event = WorkflowRunner::new(workflow)
    .run(RunOptions::new().with_input("items", json!((0..10).collect::<Vec<u32>>())))
    .await;
  let elapsed = started.elapsed();

  let EventBody::WorkflowFulfilled { outputs, .. } = &event.body else {
    panic!("expected fulfilled, got {}", event.name());
  };
  assert_eq!(outputs.get("items"), Some(&json!([0, 1, 2, 3, 4, 5, 6, 7, 8, 9])));
  assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
}

#[tokio::test]
async fn test_cancel_stops_slow_node() {
  let start = counting("start", Arc::new(AtomicUsize::new(0)));
  let slow = NodeBuilder::from_fn("slow", |_ctx: NodeContext| async move {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(Outputs::new())
  })
  .build();
  let workflow = Workflow::builder("slow", &start >> &slow).build().unwrap();

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let started = Instant::now();
  let events: Vec<WorkflowEvent> = WorkflowRunner::new(workflow)
    .stream(
      RunOptions::new().with_cancel(cancel),
      EventFilter::WorkflowAndNodes,
      None,
    )
    .collect()
    .await;

  assert!(started.elapsed() < Duration::from_secs(2));
  let terminal = events.last().unwrap();
  assert_eq!(terminal.error().map(|e| e.code), Some(ErrorCode::Cancelled));
  assert_eq!(initiated_count(&events, "slow"), 1);
  assert!(!events.iter().any(|e| matches!(
    &e.body,
    EventBody::NodeFulfilled { node_name, .. } if node_name == "slow"
  )));
}
