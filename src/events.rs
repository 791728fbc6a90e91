//! # Event Bus
//!
//! Every node invocation is observable as a sequence of [`RunEvent`]s:
//! one `start`, zero or more `chunk`s, and exactly one terminal event
//! (`end`, `error` or `cancelled`). Events carry the run identifier and the
//! parent run identifier, so the invocation records of one call form a tree
//! mirroring the shape of the composition that was executed.
//!
//! Listeners are isolated from the run: a listener that returns an error or
//! panics is logged and skipped, and the node's own outcome is what propagates.
//!
//! Two listeners ship with the crate:
//!
//! - [`TracingListener`] forwards events to `tracing`.
//! - [`EventRecorder`] keeps events in memory and rebuilds the
//!   [`RunRecord`] tree.
//!
//! # Example
//!
//! ```rust
//! use runweave::context::RunContext;
//! use runweave::events::EventRecorder;
//! use runweave::nodes::Lambda;
//! use runweave::node::Node;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let recorder = Arc::new(EventRecorder::new());
//! let ctx = RunContext::new().with_listener(recorder.clone());
//! let double = Node::new(Lambda::new("double", |v: serde_json::Value| {
//!   Ok::<_, std::io::Error>(json!(v.as_i64().unwrap_or(0) * 2))
//! }));
//! double.invoke(json!(4), &ctx).unwrap();
//! assert_eq!(recorder.run_tree()[0].node_name, "double");
//! ```

use crate::error::{RunError, RunResult};
use crate::node::NodeKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Phase of a run reported by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  /// The node is about to run; payload is the input.
  Start,
  /// An incremental output chunk; payload is the chunk.
  Chunk,
  /// The run succeeded; payload is the output.
  End,
  /// The run failed; payload holds the error message.
  Error,
  /// The run observed cancellation or was dropped before finishing.
  Cancelled,
}

impl Phase {
  /// True for `end`, `error` and `cancelled`.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Phase::End | Phase::Error | Phase::Cancelled)
  }
}

/// Structured record delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
  /// Unique identifier of the run.
  pub run_id: Uuid,
  /// Identifier of the enclosing run, if any.
  pub parent_run_id: Option<Uuid>,
  /// Variant of the node being run.
  pub node_kind: NodeKind,
  /// Name of the node being run.
  pub node_name: String,
  /// Phase reported by this event.
  pub phase: Phase,
  /// When the event was emitted.
  pub timestamp: DateTime<Utc>,
  /// Phase-specific payload.
  pub payload: Value,
  /// Tags in effect for the run.
  pub tags: Vec<String>,
  /// Metadata in effect for the run.
  pub metadata: Map<String, Value>,
}

/// Failure reported by a listener. Logged and otherwise ignored.
#[derive(Error, Debug)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receiver of run events.
pub trait Listener: Send + Sync {
  /// Handles one event.
  fn on_event(&self, event: &RunEvent) -> Result<(), ListenerError>;
}

impl<L: Listener + ?Sized> Listener for Arc<L> {
  fn on_event(&self, event: &RunEvent) -> Result<(), ListenerError> {
    (**self).on_event(event)
  }
}

/// Adapts a closure into a [`Listener`].
pub struct FnListener<F>(pub F);

impl<F> Listener for FnListener<F>
where
  F: Fn(&RunEvent) -> Result<(), ListenerError> + Send + Sync,
{
  fn on_event(&self, event: &RunEvent) -> Result<(), ListenerError> {
    (self.0)(event)
  }
}

/// Append-only, copy-on-extend list of listeners.
#[derive(Clone, Default)]
pub struct EventBus {
  listeners: Arc<Vec<Arc<dyn Listener>>>,
}

impl EventBus {
  /// Creates a bus with no listeners.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a bus with `listener` appended. `self` is left unchanged.
  pub fn with_listener(&self, listener: Arc<dyn Listener>) -> Self {
    let mut listeners = (*self.listeners).clone();
    listeners.push(listener);
    Self {
      listeners: Arc::new(listeners),
    }
  }

  /// Number of listeners.
  pub fn len(&self) -> usize {
    self.listeners.len()
  }

  /// True when no listener is attached.
  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }

  /// Delivers `event` to every listener in order.
  pub fn emit(&self, event: &RunEvent) {
    for listener in self.listeners.iter() {
      match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(
          run_id = %event.run_id,
          phase = ?event.phase,
          error = %err,
          "event listener failed"
        ),
        Err(_) => warn!(
          run_id = %event.run_id,
          phase = ?event.phase,
          "event listener panicked"
        ),
      }
    }
  }
}

/// Emitter for the events of one run.
///
/// Guarantees a single terminal event: if the scope is dropped before
/// `end`/`fail` (for example because a stream consumer stopped pulling),
/// `cancelled` is emitted.
pub(crate) struct RunScope {
  bus: EventBus,
  run_id: Uuid,
  parent_run_id: Option<Uuid>,
  kind: NodeKind,
  name: String,
  tags: Vec<String>,
  metadata: Map<String, Value>,
  finished: bool,
}

impl RunScope {
  pub(crate) fn start(
    bus: EventBus,
    parent_run_id: Option<Uuid>,
    kind: NodeKind,
    name: &str,
    tags: &BTreeSet<String>,
    metadata: &Map<String, Value>,
    input: impl FnOnce() -> Value,
  ) -> Self {
    let observed = !bus.is_empty();
    let scope = Self {
      bus,
      run_id: Uuid::new_v4(),
      parent_run_id,
      kind,
      name: name.to_string(),
      tags: if observed {
        tags.iter().cloned().collect()
      } else {
        Vec::new()
      },
      metadata: if observed { metadata.clone() } else { Map::new() },
      finished: false,
    };
    scope.emit(Phase::Start, input);
    scope
  }

  pub(crate) fn run_id(&self) -> Uuid {
    self.run_id
  }

  pub(crate) fn chunk(&self, chunk: &Value) {
    trace!(run_id = %self.run_id, node = %self.name, "chunk");
    self.emit(Phase::Chunk, || chunk.clone());
  }

  pub(crate) fn end(&mut self, output: &Value) {
    if self.finished {
      return;
    }
    self.finished = true;
    self.emit(Phase::End, || output.clone());
  }

  pub(crate) fn fail(&mut self, err: &RunError) {
    if self.finished {
      return;
    }
    self.finished = true;
    let phase = if err.is_cancelled() {
      Phase::Cancelled
    } else {
      Phase::Error
    };
    self.emit(phase, || json!({ "error": err.to_string() }));
  }

  pub(crate) fn finish(&mut self, result: &RunResult<Value>) {
    match result {
      Ok(output) => self.end(output),
      Err(err) => self.fail(err),
    }
  }

  fn emit(&self, phase: Phase, payload: impl FnOnce() -> Value) {
    if self.bus.is_empty() {
      return;
    }
    let event = RunEvent {
      run_id: self.run_id,
      parent_run_id: self.parent_run_id,
      node_kind: self.kind,
      node_name: self.name.clone(),
      phase,
      timestamp: Utc::now(),
      payload: payload(),
      tags: self.tags.clone(),
      metadata: self.metadata.clone(),
    };
    self.bus.emit(&event);
  }
}

impl Drop for RunScope {
  fn drop(&mut self) {
    if !self.finished {
      self.finished = true;
      self.emit(Phase::Cancelled, || json!({ "reason": "dropped" }));
    }
  }
}

/// Listener that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl Listener for TracingListener {
  fn on_event(&self, event: &RunEvent) -> Result<(), ListenerError> {
    match event.phase {
      Phase::Start => debug!(
        run_id = %event.run_id,
        parent_run_id = ?event.parent_run_id,
        kind = ?event.node_kind,
        node = %event.node_name,
        "run started"
      ),
      Phase::Chunk => trace!(run_id = %event.run_id, node = %event.node_name, chunk = %event.payload, "run chunk"),
      Phase::End => debug!(run_id = %event.run_id, node = %event.node_name, "run finished"),
      Phase::Error => warn!(
        run_id = %event.run_id,
        node = %event.node_name,
        error = %event.payload,
        "run failed"
      ),
      Phase::Cancelled => debug!(run_id = %event.run_id, node = %event.node_name, "run cancelled"),
    }
    Ok(())
  }
}

/// Terminal status of an invocation record.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
  /// No terminal event seen yet.
  Running,
  /// Completed with this output.
  Succeeded(Value),
  /// Failed with this message.
  Failed(String),
  /// Cancelled or dropped.
  Cancelled,
}

/// Invocation record rebuilt from events.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
  /// Run identifier.
  pub run_id: Uuid,
  /// Parent run identifier.
  pub parent_run_id: Option<Uuid>,
  /// Node variant.
  pub node_kind: NodeKind,
  /// Node name.
  pub node_name: String,
  /// Timestamp of the `start` event.
  pub started_at: DateTime<Utc>,
  /// Terminal status.
  pub status: RunStatus,
  /// Nested runs in start order.
  pub children: Vec<RunRecord>,
}

impl RunRecord {
  /// Number of runs in this subtree, including this one.
  pub fn size(&self) -> usize {
    1 + self.children.iter().map(RunRecord::size).sum::<usize>()
  }

  /// Finds the first run named `name` in this subtree (pre-order).
  pub fn find(&self, name: &str) -> Option<&RunRecord> {
    if self.node_name == name {
      return Some(self);
    }
    self.children.iter().find_map(|child| child.find(name))
  }
}

/// In-memory listener that keeps every event it receives.
#[derive(Debug, Default)]
pub struct EventRecorder {
  events: Mutex<Vec<RunEvent>>,
}

impl EventRecorder {
  /// Creates an empty recorder.
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Vec<RunEvent>> {
    self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Snapshot of all events in arrival order.
  pub fn events(&self) -> Vec<RunEvent> {
    self.lock().clone()
  }

  /// Drops all recorded events.
  pub fn clear(&self) {
    self.lock().clear();
  }

  /// Events for runs of the node named `name`.
  pub fn events_for(&self, name: &str) -> Vec<RunEvent> {
    self
      .lock()
      .iter()
      .filter(|event| event.node_name == name)
      .cloned()
      .collect()
  }

  /// Number of `phase` events emitted by runs of `name`.
  pub fn count(&self, name: &str, phase: Phase) -> usize {
    self
      .lock()
      .iter()
      .filter(|event| event.node_name == name && event.phase == phase)
      .count()
  }

  /// Payloads of the `chunk` events emitted by runs of `name`, in order.
  pub fn chunks(&self, name: &str) -> Vec<Value> {
    self
      .lock()
      .iter()
      .filter(|event| event.node_name == name && event.phase == Phase::Chunk)
      .map(|event| event.payload.clone())
      .collect()
  }

  /// Rebuilds invocation records; returns the root runs in start order.
  pub fn run_tree(&self) -> Vec<RunRecord> {
    let events = self.events();
    let mut order = Vec::new();
    let mut records: HashMap<Uuid, RunRecord> = HashMap::new();
    for event in &events {
      match event.phase {
        Phase::Start => {
          order.push(event.run_id);
          records.insert(
            event.run_id,
            RunRecord {
              run_id: event.run_id,
              parent_run_id: event.parent_run_id,
              node_kind: event.node_kind,
              node_name: event.node_name.clone(),
              started_at: event.timestamp,
              status: RunStatus::Running,
              children: Vec::new(),
            },
          );
        }
        Phase::Chunk => {}
        Phase::End => set_status(&mut records, event, RunStatus::Succeeded(event.payload.clone())),
        Phase::Error => {
          let message = event
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
          set_status(&mut records, event, RunStatus::Failed(message));
        }
        Phase::Cancelled => set_status(&mut records, event, RunStatus::Cancelled),
      }
    }

    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut roots = Vec::new();
    for run_id in &order {
      match records[run_id].parent_run_id {
        Some(parent) if records.contains_key(&parent) => {
          children.entry(parent).or_default().push(*run_id)
        }
        _ => roots.push(*run_id),
      }
    }
    roots
      .into_iter()
      .map(|run_id| assemble(run_id, &mut records, &children))
      .collect()
  }
}

impl Listener for EventRecorder {
  fn on_event(&self, event: &RunEvent) -> Result<(), ListenerError> {
    self.lock().push(event.clone());
    Ok(())
  }
}

fn set_status(records: &mut HashMap<Uuid, RunRecord>, event: &RunEvent, status: RunStatus) {
  if let Some(record) = records.get_mut(&event.run_id) {
    record.status = status;
  }
}

fn assemble(
  run_id: Uuid,
  records: &mut HashMap<Uuid, RunRecord>,
  children: &HashMap<Uuid, Vec<Uuid>>,
) -> RunRecord {
  let mut record = match records.remove(&run_id) {
    Some(record) => record,
    None => unreachable!("run {run_id} assembled twice"),
  };
  if let Some(ids) = children.get(&run_id) {
    record.children = ids
      .iter()
      .map(|child| assemble(*child, records, children))
      .collect();
  }
  record
}
