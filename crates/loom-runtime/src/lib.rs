//! Loom workflow runtime.
//!
//! - [`WorkflowRunner`]: schedules node activations and streams events
//! - [`WorkflowEvent`]: the lifecycle events of runs and nodes
//! - [`EventEmitter`] / [`HistorySource`]: where events and snapshots go, and
//!   where resumed runs read them back from
//! - [`nodes`]: composite bodies (subworkflow, map, try, retry)

mod config;
mod emitter;
mod error;
mod events;
mod history;
mod nested;
pub mod nodes;
mod runner;

pub use config::RunnerConfig;
pub use emitter::{ChannelEmitter, Emitted, EventEmitter, NoopEmitter};
pub use error::RuntimeError;
pub use events::{EventBody, EventFilter, ParentContext, WorkflowEvent};
pub use history::{HistorySource, InMemoryStore};
pub use nodes::{MapNode, RetryNode, SubworkflowNode, TryNode};
pub use runner::{RunOptions, WorkflowEventStream, WorkflowRunner};
