//! Composite node bodies that embed a nested run.
//!
//! Each wraps a [`Workflow`](loom_workflow::Workflow) and is declared like any
//! other body:
//!
//! ```ignore
//! let fan_out = NodeBuilder::new("fan_out", MapNode::new(per_item).with_concurrency(4))
//!   .attribute("items", search.output("results"))
//!   .build();
//! ```

mod map;
mod retry;
mod subworkflow;
mod try_node;

pub use map::MapNode;
pub use retry::RetryNode;
pub use subworkflow::SubworkflowNode;
pub use try_node::TryNode;
