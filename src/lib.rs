//! Loom: a graph-based pipeline execution engine.
//!
//! Nodes are declared with [`NodeBuilder`], wired together with `>>` into a
//! [`Graph`], wrapped in a [`Workflow`] and executed by a [`WorkflowRunner`]:
//!
//! ```ignore
//! use loom::prelude::*;
//!
//! let search = NodeBuilder::from_fn("search", |ctx: NodeContext| async move {
//!   let query: String = ctx.get("query")?;
//!   Ok::<_, NodeError>(Outputs::new().with("results", vec![query]))
//! })
//! .attribute("query", Expr::input("query"))
//! .build();
//!
//! let workflow = Workflow::builder("search", &search)
//!   .input("query")
//!   .output("results", search.output("results"))
//!   .build()?;
//!
//! let event = WorkflowRunner::new(workflow)
//!   .run(RunOptions::new().with_input("query", "rust"))
//!   .await;
//! ```

pub use loom_runtime::{
  ChannelEmitter, Emitted, EventBody, EventEmitter, EventFilter, HistorySource, InMemoryStore,
  MapNode, NoopEmitter, ParentContext, RetryNode, RunOptions, RunnerConfig, RuntimeError,
  SubworkflowNode, TryNode, WorkflowEvent, WorkflowEventStream, WorkflowRunner,
};
pub use loom_state::{
  ActivationId, CompareOp, Descriptor, ExecutionCache, Expr, ExprError, ExternalInputRef,
  IntoExpr, NodeId, OutputRef, SnapshotCallback, State, StateError,
};
pub use loom_workflow::{
  ConditionType, DEFAULT_PORT, Edge, ErrorCode, FnNode, Graph, GraphError, GraphOperand,
  MergeBehavior, NestedRun, Node, NodeBuilder, NodeContext, NodeDefinition, NodeError, NodeRef,
  NodeRun, Output, Outputs, Port, PortError, PortId, PortRef, PortSet, Workflow, WorkflowBuilder,
  WorkflowError,
};

/// Everything needed to declare and run a workflow.
pub mod prelude {
  pub use crate::{
    ErrorCode, EventFilter, Expr, MergeBehavior, Node, NodeBuilder, NodeContext, NodeError,
    NodeRef, NodeRun, Output, Outputs, Port, RunOptions, Workflow, WorkflowEvent, WorkflowRunner,
  };
}
