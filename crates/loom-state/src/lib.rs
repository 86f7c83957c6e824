//! Run-scoped state for loom workflows.
//!
//! - [`State`]: workflow inputs, external inputs, published node outputs,
//!   user state fields and the [`ExecutionCache`] of a single run
//! - [`Expr`] / [`Descriptor`]: lazy references into a state, resolved on
//!   demand
//! - [`NodeId`]: deterministic node identity

mod cache;
mod error;
mod expr;
mod id;
mod state;
mod template;

pub use cache::ExecutionCache;
pub use error::{ExprError, StateError};
pub use expr::{CompareOp, Descriptor, Expr, IntoExpr};
pub use id::{ActivationId, ExternalInputRef, NodeId, OutputRef};
pub use state::{SnapshotCallback, State};
