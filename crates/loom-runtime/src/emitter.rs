//! Event sinks.
//!
//! The runner calls [`EventEmitter::emit`] for every event it produces or
//! relays, and [`EventEmitter::snapshot`] after every state mutation.
//! Implementations decide what to do with them (persist, broadcast, log,
//! ignore).

use loom_state::State;
use tokio::sync::mpsc;

use crate::events::WorkflowEvent;

pub trait EventEmitter: Send + Sync {
  fn emit(&self, event: &WorkflowEvent);

  fn snapshot(&self, state: &State);
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
  fn emit(&self, _event: &WorkflowEvent) {}

  fn snapshot(&self, _state: &State) {}
}

/// What a [`ChannelEmitter`] forwards.
#[derive(Debug, Clone)]
pub enum Emitted {
  Event(WorkflowEvent),
  Snapshot(State),
}

/// Forwards events and snapshots to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
  // Unbounded so a slow observer never stalls the scheduler.
  sender: mpsc::UnboundedSender<Emitted>,
}

impl ChannelEmitter {
  pub fn new(sender: mpsc::UnboundedSender<Emitted>) -> Self {
    Self { sender }
  }
}

impl EventEmitter for ChannelEmitter {
  fn emit(&self, event: &WorkflowEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(Emitted::Event(event.clone()));
  }

  fn snapshot(&self, state: &State) {
    let _ = self.sender.send(Emitted::Snapshot(state.clone()));
  }
}
