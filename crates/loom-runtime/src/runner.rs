//! The workflow runner.
//!
//! A run is driven by one consumer task. Node bodies execute in worker tasks
//! and report back over a single unbounded channel; the consumer is the only
//! code that mutates the run [`State`] and its execution cache. Events leave
//! through a bounded channel wrapped in a [`WorkflowEventStream`].

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use loom_state::{ActivationId, Expr, ExternalInputRef, NodeId, State};
use loom_workflow::{
  ErrorCode, NestedRun, Node, NodeContext, NodeError, NodeRef, NodeRun, Output, Outputs, PortId,
  Workflow, WorkflowError,
};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::emitter::{EventEmitter, NoopEmitter};
use crate::events::{EventBody, EventFilter, ParentContext, WorkflowEvent};
use crate::history::HistorySource;
use crate::nested::NestedRunner;

/// Options for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub inputs: BTreeMap<String, Value>,
  /// Persisted state to resume from.
  pub state: Option<State>,
  /// Nodes to start from instead of the graph entrypoints.
  pub entrypoint_nodes: Vec<NodeId>,
  pub external_inputs: BTreeMap<ExternalInputRef, Value>,
  /// Resume the given execution from the configured [`HistorySource`].
  pub previous_execution_id: Option<Uuid>,
  pub cancel: Option<CancellationToken>,
  pub(crate) parent_state: Option<State>,
}

impl RunOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_inputs<K: Into<String>, V: Into<Value>>(
    mut self,
    inputs: impl IntoIterator<Item = (K, V)>,
  ) -> Self {
    self
      .inputs
      .extend(inputs.into_iter().map(|(k, v)| (k.into(), v.into())));
    self
  }

  pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.inputs.insert(name.into(), value.into());
    self
  }

  pub fn with_state(mut self, state: State) -> Self {
    self.state = Some(state);
    self
  }

  pub fn with_entrypoints(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
    self.entrypoint_nodes.extend(nodes);
    self
  }

  pub fn with_external_input(mut self, reference: ExternalInputRef, value: impl Into<Value>) -> Self {
    self.external_inputs.insert(reference, value.into());
    self
  }

  pub fn resume_from(mut self, execution_id: Uuid) -> Self {
    self.previous_execution_id = Some(execution_id);
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = Some(cancel);
    self
  }
}

/// Runs one workflow definition.
///
/// # Usage
///
/// ```ignore
/// let runner = WorkflowRunner::new(workflow).with_emitter(Arc::new(store));
///
/// // Wait for the terminal event
/// let event = runner.run(RunOptions::new().with_input("query", "rust")).await;
///
/// // Or observe the run as it happens
/// let mut events = runner.stream_default(RunOptions::new());
/// while let Some(event) = events.next().await { /* ... */ }
/// ```
#[derive(Clone)]
pub struct WorkflowRunner {
  workflow: Arc<Workflow>,
  config: RunnerConfig,
  emitter: Arc<dyn EventEmitter>,
  history: Option<Arc<dyn HistorySource>>,
  parent: Option<ParentContext>,
}

impl WorkflowRunner {
  pub fn new(workflow: Workflow) -> Self {
    Self::from_shared(Arc::new(workflow))
  }

  pub fn from_shared(workflow: Arc<Workflow>) -> Self {
    Self {
      workflow,
      config: RunnerConfig::default(),
      emitter: Arc::new(NoopEmitter),
      history: None,
      parent: None,
    }
  }

  pub fn with_config(mut self, config: RunnerConfig) -> Self {
    self.config = config;
    self
  }

  /// Receives every event and state snapshot, regardless of stream filters.
  pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
    self.emitter = emitter;
    self
  }

  pub fn with_history(mut self, history: Arc<dyn HistorySource>) -> Self {
    self.history = Some(history);
    self
  }

  pub(crate) fn with_parent(mut self, parent: ParentContext) -> Self {
    self.parent = Some(parent);
    self
  }

  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  pub fn config(&self) -> &RunnerConfig {
    &self.config
  }

  /// Execute the workflow and return its terminal event.
  ///
  /// Never fails: errors surface as a `workflow.execution.rejected` event.
  #[instrument(
    name = "workflow_run",
    skip(self, options),
    fields(workflow_name = %self.workflow.name())
  )]
  pub async fn run(&self, options: RunOptions) -> WorkflowEvent {
    let mut events = self.stream(options, EventFilter::Workflow, None);
    let execution_id = events.execution_id();

    let mut terminal = None;
    while let Some(event) = events.next().await {
      if event.is_terminal() && event.span_id == execution_id {
        terminal = Some(event);
      }
    }

    terminal.unwrap_or_else(|| {
      error!(execution_id = %execution_id, "run ended without a terminal event");
      WorkflowEvent::new(
        execution_id,
        execution_id,
        self.parent.clone(),
        EventBody::WorkflowRejected {
          workflow_name: self.workflow.name().to_string(),
          error: WorkflowError::new(
            ErrorCode::InternalError,
            "Run ended without a terminal event",
          ),
        },
      )
    })
  }

  /// Execute the workflow and stream its events.
  ///
  /// `names` restricts the stream to the given event names; the terminal
  /// event is always delivered.
  pub fn stream(
    &self,
    options: RunOptions,
    filter: EventFilter,
    names: Option<BTreeSet<String>>,
  ) -> WorkflowEventStream {
    let execution_id = Uuid::new_v4();
    let (sender, receiver) = mpsc::channel(self.config.event_buffer.max(1));
    let sink = EventSink {
      sender,
      emitter: self.emitter.clone(),
      filter,
      names,
      execution_id,
    };

    let consumer = Consumer::new(self.clone(), execution_id, sink, &options);
    let handle = tokio::spawn(consumer.drive(options));

    WorkflowEventStream {
      receiver,
      execution_id,
      done: false,
      handle,
    }
  }

  /// [`stream`](Self::stream) with the configured default filter.
  pub fn stream_default(&self, options: RunOptions) -> WorkflowEventStream {
    self.stream(options, self.config.default_filter, None)
  }
}

/// Events of one run.
///
/// Ends right after the run's terminal event. Dropping the stream aborts the
/// run.
pub struct WorkflowEventStream {
  receiver: mpsc::Receiver<WorkflowEvent>,
  execution_id: Uuid,
  done: bool,
  handle: JoinHandle<()>,
}

impl WorkflowEventStream {
  pub fn execution_id(&self) -> Uuid {
    self.execution_id
  }
}

impl Stream for WorkflowEventStream {
  type Item = WorkflowEvent;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    if self.done {
      return Poll::Ready(None);
    }
    match self.receiver.poll_recv(cx) {
      Poll::Ready(Some(event)) => {
        if event.is_terminal() && event.span_id == self.execution_id {
          self.done = true;
        }
        Poll::Ready(Some(event))
      }
      Poll::Ready(None) => {
        self.done = true;
        Poll::Ready(None)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl Drop for WorkflowEventStream {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Hands every event to the emitter and the filtered ones to the stream.
struct EventSink {
  sender: mpsc::Sender<WorkflowEvent>,
  emitter: Arc<dyn EventEmitter>,
  filter: EventFilter,
  names: Option<BTreeSet<String>>,
  execution_id: Uuid,
}

impl EventSink {
  async fn send(&self, event: WorkflowEvent) {
    self.emitter.emit(&event);

    let own_terminal = event.is_terminal() && event.span_id == self.execution_id;
    let named = self
      .names
      .as_ref()
      .is_none_or(|names| names.contains(event.name()));
    if own_terminal || (named && self.filter.accepts(&event, self.execution_id)) {
      // Ignore send errors - receiver may have been dropped
      let _ = self.sender.send(event).await;
    }
  }
}

/// Messages from workers (and relayed nested runs) to the consumer.
pub(crate) enum WorkItem {
  Streaming {
    activation: ActivationId,
    output: Output,
  },
  Fulfilled {
    activation: ActivationId,
    outputs: Outputs,
    state_patches: Vec<(String, Value)>,
  },
  Rejected {
    activation: ActivationId,
    error: NodeError,
  },
  Relay(WorkflowEvent),
}

struct Activation {
  node: NodeRef,
  fork: Option<State>,
}

enum Termination {
  Fulfilled(Outputs),
  Paused(Vec<ExternalInputRef>),
}

/// The single consumer of a run.
struct Consumer {
  runner: WorkflowRunner,
  execution_id: Uuid,
  trace_id: Uuid,
  sink: EventSink,
  state: State,
  cancel: CancellationToken,
  active: BTreeMap<ActivationId, Activation>,
  paused: BTreeMap<NodeId, Vec<ExternalInputRef>>,
  workers: JoinSet<()>,
  worker_tx: mpsc::UnboundedSender<WorkItem>,
  worker_rx: mpsc::UnboundedReceiver<WorkItem>,
  permits: Option<Arc<Semaphore>>,
  nested: Arc<dyn NestedRun>,
}

impl Consumer {
  fn new(runner: WorkflowRunner, execution_id: Uuid, sink: EventSink, options: &RunOptions) -> Self {
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let permits = runner
      .config
      .max_concurrency
      .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let nested: Arc<dyn NestedRun> = Arc::new(NestedRunner::new(
      worker_tx.clone(),
      runner.emitter.clone(),
      runner.config.clone(),
      ParentContext::Workflow {
        workflow_name: runner.workflow.name().to_string(),
        span_id: execution_id,
        parent: runner.parent.clone().map(Box::new),
      },
    ));

    Self {
      execution_id,
      trace_id: execution_id,
      sink,
      state: State::default().with_span_id(execution_id),
      cancel: options.cancel.clone().unwrap_or_default(),
      active: BTreeMap::new(),
      paused: BTreeMap::new(),
      workers: JoinSet::new(),
      worker_tx,
      worker_rx,
      permits,
      nested,
      runner,
    }
  }

  async fn drive(mut self, options: RunOptions) {
    let workflow_name = self.runner.workflow.name().to_string();
    let outcome = AssertUnwindSafe(self.execute(options)).catch_unwind().await;
    self.workers.abort_all();

    let body = match outcome {
      Ok(Ok(Termination::Fulfilled(outputs))) => {
        info!(execution_id = %self.execution_id, "workflow_fulfilled");
        EventBody::WorkflowFulfilled {
          workflow_name,
          outputs,
        }
      }
      Ok(Ok(Termination::Paused(external_inputs))) => {
        info!(
          execution_id = %self.execution_id,
          awaiting = external_inputs.len(),
          "workflow_paused"
        );
        EventBody::WorkflowPaused {
          workflow_name,
          external_inputs,
        }
      }
      Ok(Err(error)) => {
        if error.code == ErrorCode::Cancelled {
          warn!(execution_id = %self.execution_id, "workflow cancelled");
        } else {
          error!(execution_id = %self.execution_id, error = %error, "workflow_rejected");
        }
        EventBody::WorkflowRejected {
          workflow_name,
          error,
        }
      }
      Err(panic) => {
        let message = panic_message("Workflow", panic);
        error!(execution_id = %self.execution_id, error = %message, "workflow panicked");
        EventBody::WorkflowRejected {
          workflow_name,
          error: WorkflowError::new(ErrorCode::InternalError, message),
        }
      }
    };

    self.emit_workflow(body).await;
  }

  async fn execute(&mut self, options: RunOptions) -> Result<Termination, WorkflowError> {
    let RunOptions {
      inputs,
      state,
      entrypoint_nodes,
      external_inputs,
      previous_execution_id,
      parent_state,
      ..
    } = options;

    let mut paused_nodes = Vec::new();
    let (state, resuming) = match (state, previous_execution_id) {
      (Some(state), _) => (state, true),
      (None, Some(previous)) => {
        let (state, paused) = self.load_history(previous).await?;
        paused_nodes = paused;
        (state, true)
      }
      (None, None) => {
        self.trace_id = parent_state
          .as_ref()
          .map(State::trace_id)
          .unwrap_or_else(Uuid::new_v4);
        info!(
          execution_id = %self.execution_id,
          trace_id = %self.trace_id,
          workflow_name = %self.runner.workflow.name(),
          "workflow_started"
        );
        self
          .emit_workflow(EventBody::WorkflowInitiated {
            workflow_name: self.runner.workflow.name().to_string(),
            inputs: inputs.clone(),
          })
          .await;

        let mut state = State::new(self.runner.workflow.prepare_inputs(inputs)?)
          .with_trace_id(self.trace_id);
        if let Some(parent) = parent_state {
          state = state.with_parent(parent);
        }
        (state, false)
      }
    };

    self.trace_id = state.trace_id();
    self.state = state.with_span_id(self.execution_id);
    let emitter = self.runner.emitter.clone();
    self
      .state
      .on_snapshot(Arc::new(move |snapshot| emitter.snapshot(&snapshot)));
    for (reference, value) in &external_inputs {
      self.state.set_external_input(reference, value.clone());
    }

    let entries = if !entrypoint_nodes.is_empty() {
      entrypoint_nodes
    } else if resuming {
      external_inputs
        .keys()
        .map(|reference| reference.node)
        .chain(paused_nodes)
        .collect()
    } else {
      self.runner.workflow.graph().entrypoints().to_vec()
    };

    let mut seen = BTreeSet::new();
    let mut nodes = Vec::new();
    for id in entries {
      if !seen.insert(id) {
        continue;
      }
      let node = self.runner.workflow.node(id).cloned().ok_or_else(|| {
        WorkflowError::new(
          ErrorCode::InvalidWorkflow,
          format!("Node {} is not part of workflow '{}'", id, self.runner.workflow.name()),
        )
      })?;
      nodes.push(node);
    }

    if resuming {
      if nodes.is_empty() {
        return Err(WorkflowError::new(
          ErrorCode::InvalidState,
          "Nothing to resume: no external inputs, paused nodes or entrypoints were given",
        ));
      }
      info!(execution_id = %self.execution_id, "workflow_resumed");
      self
        .emit_workflow(EventBody::WorkflowResumed {
          workflow_name: self.runner.workflow.name().to_string(),
        })
        .await;
    }

    for node in nodes {
      let activation = self
        .state
        .update_cache(|cache| cache.queue_activation(node.id(), &BTreeSet::new(), None));
      if resuming {
        self
          .emit_node(
            activation,
            EventBody::NodeResumed {
              node_id: node.id(),
              node_name: node.name().to_string(),
            },
          )
          .await;
      }
      self.launch(node, activation, false).await?;
    }

    self.event_loop().await
  }

  /// Rebuild the state and the paused nodes of an earlier execution.
  async fn load_history(&mut self, previous: Uuid) -> Result<(State, Vec<NodeId>), WorkflowError> {
    let history = self.runner.history.clone().ok_or_else(|| {
      WorkflowError::new(
        ErrorCode::InvalidState,
        "Cannot resume by execution id without a history source",
      )
    })?;
    let unavailable = |e: crate::error::RuntimeError| {
      WorkflowError::new(ErrorCode::InvalidState, e.to_string())
    };

    let state = history
      .state_snapshot_history(previous)
      .await
      .map_err(unavailable)?
      .pop()
      .ok_or_else(|| {
        WorkflowError::new(
          ErrorCode::InvalidState,
          format!("Execution {previous} has no state snapshots"),
        )
      })?;

    let mut paused = BTreeSet::new();
    for event in history.latest_events(previous).await.map_err(unavailable)? {
      let own_node = matches!(
        &event.parent,
        Some(ParentContext::Workflow { span_id, .. }) if *span_id == previous
      );
      if !own_node {
        continue;
      }
      match &event.body {
        EventBody::NodePaused { node_id, .. } => {
          paused.insert(*node_id);
        }
        EventBody::NodeInitiated { node_id, .. } => {
          paused.remove(node_id);
        }
        _ => {}
      }
    }

    debug!(previous = %previous, paused = paused.len(), "loaded execution history");
    Ok((state, paused.into_iter().collect()))
  }

  async fn event_loop(&mut self) -> Result<Termination, WorkflowError> {
    let cancel = self.cancel.clone();
    while !self.active.is_empty() {
      let item = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(WorkflowError::cancelled()),
        item = self.worker_rx.recv() => item,
      };
      let Some(item) = item else {
        break;
      };

      match item {
        WorkItem::Streaming { activation, output } => self.on_streaming(activation, output).await,
        WorkItem::Fulfilled {
          activation,
          outputs,
          state_patches,
        } => self.on_fulfilled(activation, outputs, state_patches).await?,
        WorkItem::Rejected { activation, error } => {
          if let Some(Activation { node, .. }) = self.active.remove(&activation) {
            return Err(self.reject_node(&node, activation, error).await);
          }
        }
        WorkItem::Relay(event) => self.sink.send(event).await,
      }

      while self.workers.try_join_next().is_some() {}
    }

    if self.paused.is_empty() {
      Ok(Termination::Fulfilled(
        self.runner.workflow.resolve_outputs(&self.state)?,
      ))
    } else {
      Ok(Termination::Paused(
        self.paused.values().flatten().cloned().collect(),
      ))
    }
  }

  /// Start an activation, or park it when external inputs are missing.
  async fn launch(
    &mut self,
    node: NodeRef,
    activation: ActivationId,
    fork: bool,
  ) -> Result<(), WorkflowError> {
    if self.cancel.is_cancelled() {
      return Err(WorkflowError::cancelled());
    }

    let missing = node.missing_external_inputs(&self.state);
    if !missing.is_empty() {
      info!(
        execution_id = %self.execution_id,
        node_id = %node.id(),
        node_name = %node.name(),
        span_id = %activation,
        "node_paused"
      );
      self
        .emit_node(
          activation,
          EventBody::NodePaused {
            node_id: node.id(),
            node_name: node.name().to_string(),
            external_inputs: missing.clone(),
          },
        )
        .await;
      self.paused.insert(node.id(), missing);
      return Ok(());
    }
    self.paused.remove(&node.id());

    let attributes = match resolve_attributes(&node, &self.state) {
      Ok(attributes) => attributes,
      Err(error) => return Err(self.initiate_and_reject(&node, activation, error).await),
    };
    self.initiate(&node, activation, attributes.clone()).await?;

    let fork = fork.then(|| self.state.fork());
    let view = Arc::new(fork.clone().unwrap_or_else(|| self.state.clone()));
    let ctx = NodeContext::new(
      &node,
      activation,
      attributes,
      view,
      self.cancel.child_token(),
      self.nested.clone(),
    );

    let span = info_span!(
      "node_execute",
      execution_id = %self.execution_id,
      node_id = %node.id(),
      node_name = %node.name(),
      span_id = %activation,
    );
    let body = node.body();
    let sender = self.worker_tx.clone();
    let permits = self.permits.clone();
    self.workers.spawn(
      async move {
        let _permit = match permits {
          Some(permits) => permits.acquire_owned().await.ok(),
          None => None,
        };
        execute_node(body, ctx, activation, sender).await;
      }
      .instrument(span),
    );

    self.active.insert(activation, Activation { node, fork });
    Ok(())
  }

  async fn on_streaming(&mut self, activation: ActivationId, output: Output) {
    let Some(node) = self.active.get(&activation).map(|a| a.node.clone()) else {
      return;
    };

    self
      .emit_node(
        activation,
        EventBody::NodeStreaming {
          node_id: node.id(),
          node_name: node.name().to_string(),
          output: output.clone(),
        },
      )
      .await;

    // Workflow outputs that pass a node output through stream with it.
    let streamed: Vec<String> = self
      .runner
      .workflow
      .output_exprs()
      .iter()
      .filter(|(_, expr)| {
        matches!(expr, Expr::NodeOutput(reference)
          if reference.node == node.id() && reference.name == output.name())
      })
      .map(|(name, _)| name.clone())
      .collect();
    for name in streamed {
      let renamed = match &output {
        Output::Initiated { .. } => Output::initiated(name),
        Output::Streaming { delta, .. } => Output::streaming(name, delta.clone()),
        Output::Fulfilled { value, .. } => Output::fulfilled(name, value.clone()),
      };
      self
        .emit_workflow(EventBody::WorkflowStreaming {
          workflow_name: self.runner.workflow.name().to_string(),
          output: renamed,
        })
        .await;
    }
  }

  async fn on_fulfilled(
    &mut self,
    activation: ActivationId,
    outputs: Outputs,
    state_patches: Vec<(String, Value)>,
  ) -> Result<(), WorkflowError> {
    let Some(Activation { node, fork }) = self.active.remove(&activation) else {
      return Ok(());
    };

    if let Err(error) = node.validate_outputs(&outputs) {
      return Err(self.reject_node(&node, activation, error).await);
    }

    self.state.publish_outputs(
      node.id(),
      outputs.iter().map(|(name, value)| (name.clone(), value.clone())),
    );
    match fork {
      Some(mut fork) => {
        for (name, value) in state_patches {
          fork.set_field(name, value);
        }
        self.state.merge(&fork);
      }
      None => {
        for (name, value) in state_patches {
          self.state.set_field(name, value);
        }
      }
    }

    let invoked: Vec<(String, bool)> = match node.ports().invoked(&self.state) {
      Ok(ports) => ports
        .into_iter()
        .map(|port| (port.name().to_string(), port.forks_state()))
        .collect(),
      Err(error) => return Err(self.reject_node(&node, activation, error).await),
    };

    self
      .state
      .update_cache(|cache| cache.fulfill(node.id(), activation));

    info!(
      execution_id = %self.execution_id,
      node_id = %node.id(),
      node_name = %node.name(),
      span_id = %activation,
      invoked_ports = ?invoked.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
      "node_fulfilled"
    );
    self
      .emit_node(
        activation,
        EventBody::NodeFulfilled {
          node_id: node.id(),
          node_name: node.name().to_string(),
          outputs,
          invoked_ports: invoked.iter().map(|(name, _)| name.clone()).collect(),
        },
      )
      .await;

    for (port, forks_state) in invoked {
      let port = PortId::new(node.id(), port);
      let targets: Vec<NodeId> = self.runner.workflow.graph().downstream(&port).collect();
      for target in targets {
        let Some(target) = self.runner.workflow.node(target).cloned() else {
          continue;
        };
        let dependencies = self.runner.workflow.dependencies(target.id());
        let next = self.state.update_cache(|cache| {
          cache.queue_activation(target.id(), &dependencies, Some(node.id()))
        });

        let ready = match target.merge_behavior().should_initiate(
          &target,
          &self.state,
          &dependencies,
          next,
        ) {
          Ok(ready) => ready,
          Err(e) => return Err(self.initiate_and_reject(&target, next, e.into()).await),
        };
        if ready {
          self.launch(target, next, forks_state).await?;
        } else {
          debug!(
            execution_id = %self.execution_id,
            node_name = %target.name(),
            span_id = %next,
            "activation waiting on trigger"
          );
        }
      }
    }

    Ok(())
  }

  /// Mark the activation initiated and announce it.
  async fn initiate(
    &mut self,
    node: &NodeRef,
    activation: ActivationId,
    inputs: BTreeMap<String, Value>,
  ) -> Result<(), WorkflowError> {
    if let Err(e) = self
      .state
      .update_cache(|cache| cache.initiate(node.id(), activation))
    {
      return Err(WorkflowError::new(ErrorCode::InvalidState, e.to_string()));
    }

    info!(
      execution_id = %self.execution_id,
      node_id = %node.id(),
      node_name = %node.name(),
      span_id = %activation,
      "node_initiated"
    );
    self
      .emit_node(
        activation,
        EventBody::NodeInitiated {
          node_id: node.id(),
          node_name: node.name().to_string(),
          inputs,
        },
      )
      .await;
    Ok(())
  }

  /// Reject an activation that failed before its body could start.
  ///
  /// The node still reports `initiated` first, with no inputs.
  async fn initiate_and_reject(
    &mut self,
    node: &NodeRef,
    activation: ActivationId,
    error: NodeError,
  ) -> WorkflowError {
    if let Err(e) = self.initiate(node, activation, BTreeMap::new()).await {
      return e;
    }
    self.reject_node(node, activation, error).await
  }

  async fn reject_node(
    &mut self,
    node: &NodeRef,
    activation: ActivationId,
    error: NodeError,
  ) -> WorkflowError {
    error!(
      execution_id = %self.execution_id,
      node_id = %node.id(),
      node_name = %node.name(),
      span_id = %activation,
      error = %error,
      "node_rejected"
    );
    self
      .emit_node(
        activation,
        EventBody::NodeRejected {
          node_id: node.id(),
          node_name: node.name().to_string(),
          error: error.clone(),
        },
      )
      .await;
    error.into()
  }

  fn workflow_context(&self) -> ParentContext {
    ParentContext::Workflow {
      workflow_name: self.runner.workflow.name().to_string(),
      span_id: self.execution_id,
      parent: self.runner.parent.clone().map(Box::new),
    }
  }

  async fn emit_workflow(&self, body: EventBody) {
    let event = WorkflowEvent::new(
      self.trace_id,
      self.execution_id,
      self.runner.parent.clone(),
      body,
    );
    self.sink.send(event).await;
  }

  async fn emit_node(&self, activation: ActivationId, body: EventBody) {
    let event = WorkflowEvent::new(
      self.trace_id,
      activation,
      Some(self.workflow_context()),
      body,
    );
    self.sink.send(event).await;
  }
}

/// Resolve a node's attribute descriptors against the run state.
///
/// Attributes that are still undefined are left out.
fn resolve_attributes(node: &NodeRef, state: &State) -> Result<BTreeMap<String, Value>, NodeError> {
  let mut attributes = BTreeMap::new();
  for (name, expr) in node.attributes() {
    if let Some(value) = expr.resolve(state)? {
      attributes.insert(name.clone(), value);
    }
  }
  Ok(attributes)
}

/// Worker body: run the node and report the result to the consumer.
async fn execute_node(
  body: Arc<dyn Node>,
  ctx: NodeContext,
  activation: ActivationId,
  sender: mpsc::UnboundedSender<WorkItem>,
) {
  let outcome = AssertUnwindSafe(collect_outputs(body, ctx.clone(), activation, &sender))
    .catch_unwind()
    .await;

  let item = match outcome {
    Ok(Ok(outputs)) => WorkItem::Fulfilled {
      activation,
      outputs,
      state_patches: ctx.take_state_patches(),
    },
    Ok(Err(error)) => WorkItem::Rejected { activation, error },
    Err(panic) => WorkItem::Rejected {
      activation,
      error: NodeError::internal(panic_message("Node", panic)),
    },
  };
  // Ignore send errors - the run may already be over
  let _ = sender.send(item);
}

/// Drive the node body to completion.
///
/// A streamed output moves from initiated through streaming to fulfilled and
/// never past it. Every streamed output must end fulfilled.
async fn collect_outputs(
  body: Arc<dyn Node>,
  ctx: NodeContext,
  activation: ActivationId,
  sender: &mpsc::UnboundedSender<WorkItem>,
) -> Result<Outputs, NodeError> {
  let node_name = ctx.node_name().to_string();
  match body.run(ctx).await? {
    NodeRun::Outputs(outputs) => Ok(outputs),
    NodeRun::Stream(mut stream) => {
      let mut outputs = Outputs::new();
      let mut open = BTreeSet::new();
      while let Some(output) = stream.next().await {
        let output = output?;
        if outputs.contains(output.name()) {
          return Err(NodeError::new(
            ErrorCode::InvalidOutputs,
            format!(
              "Node '{node_name}' streamed output '{}' after fulfilling it",
              output.name()
            ),
          ));
        }
        match &output {
          Output::Fulfilled { name, value } => {
            open.remove(name);
            outputs.insert(name.clone(), value.clone());
          }
          Output::Initiated { name } | Output::Streaming { name, .. } => {
            open.insert(name.clone());
          }
        }
        let _ = sender.send(WorkItem::Streaming { activation, output });
      }
      if let Some(name) = open.first() {
        return Err(NodeError::new(
          ErrorCode::InvalidOutputs,
          format!("Node '{node_name}' never fulfilled streamed output '{name}'"),
        ));
      }
      Ok(outputs)
    }
  }
}

/// Describe a caught panic; `scope` names what panicked.
pub(crate) fn panic_message(scope: &str, panic: Box<dyn Any + Send>) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    format!("{scope} panicked: {message}")
  } else if let Some(message) = panic.downcast_ref::<String>() {
    format!("{scope} panicked: {message}")
  } else {
    format!("{scope} panicked")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_panic_message_names_its_scope() {
    let node = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
    let workflow = std::panic::catch_unwind(|| panic!("{}", String::from("lost"))).unwrap_err();

    assert_eq!(panic_message("Node", node), "Node panicked: boom");
    assert_eq!(panic_message("Workflow", workflow), "Workflow panicked: lost");
    assert_eq!(panic_message("Workflow", Box::new(7)), "Workflow panicked");
  }
}
