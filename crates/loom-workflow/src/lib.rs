//! Loom workflow definitions.
//!
//! This crate describes *what* runs:
//! - [`NodeBuilder`] / [`NodeRef`]: node definitions and the [`Node`] body trait
//! - [`Port`] / [`PortSet`]: conditional exits of a node
//! - [`Graph`]: the `>>` composition algebra
//! - [`MergeBehavior`]: join semantics for nodes with several dependencies
//! - [`Workflow`]: a validated graph with its input and output contract
//!
//! Execution lives in `loom-runtime`.

mod error;
mod graph;
mod node;
mod outputs;
mod port;
mod trigger;
mod workflow;

pub use error::{ErrorCode, GraphError, NodeError, PortError, WorkflowError};
pub use graph::{Edge, Graph, GraphOperand, PortId};
pub use node::{
  FnNode, NestedRun, Node, NodeBuilder, NodeContext, NodeDefinition, NodeRef, NodeRun, PortRef,
};
pub use outputs::{Output, Outputs};
pub use port::{ConditionType, DEFAULT_PORT, Port, PortSet};
pub use trigger::MergeBehavior;
pub use workflow::{Workflow, WorkflowBuilder};
