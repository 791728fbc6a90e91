//! # Execution Context
//!
//! A [`RunContext`] is threaded explicitly through every node invocation. It
//! carries the event listeners, tags, metadata and bound parameters of the run,
//! a shared concurrency budget, the recursion guard and the cancellation signal.
//!
//! ## Propagation
//!
//! Contexts are values. Extending tags, metadata or params returns a new context
//! and never changes the view of the context it was derived from. The concurrency
//! budget and the cancellation signal are shared: every nested context created
//! while traversing one top-level call acquires from the same semaphore and
//! observes the same signal.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. The engine checks the signal each time it enters
//! a node; work already running is never interrupted. Leaves that want to stop
//! early poll [`RunContext::is_cancelled`] or await [`RunContext::cancelled`].
//! Timeouts are a derived cancellation source: a timer cancels a child token.

use crate::config::{DEFAULT_RECURSION_LIMIT, RunConfig, default_max_concurrency};
use crate::error::{RunError, RunResult};
use crate::events::{EventBus, Listener, RunScope};
use crate::node::NodeKind;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

/// Counting semaphore bounding concurrent leaf invocations across a call tree.
#[derive(Debug, Clone)]
pub struct ConcurrencyBudget {
  semaphore: Arc<Semaphore>,
  limit: usize,
}

impl ConcurrencyBudget {
  /// Creates a budget with `limit` permits (at least one).
  pub fn new(limit: usize) -> Self {
    let limit = limit.max(1);
    Self {
      semaphore: Arc::new(Semaphore::new(limit)),
      limit,
    }
  }

  /// Total number of permits.
  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Permits not currently held.
  pub fn available(&self) -> usize {
    self.semaphore.available_permits()
  }

  /// Waits for a permit. The permit is released when dropped.
  pub async fn acquire(&self) -> RunResult<OwnedSemaphorePermit> {
    self
      .semaphore
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| RunError::Worker("concurrency budget closed".to_string()))
  }

  /// Blocks the calling thread until a permit is available.
  pub fn acquire_blocking(&self) -> RunResult<OwnedSemaphorePermit> {
    if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
      return Ok(permit);
    }
    futures::executor::block_on(self.acquire())
  }
}

/// Per-call bundle of listeners, annotations, budget, depth guard and cancellation signal.
#[derive(Clone)]
pub struct RunContext {
  bus: EventBus,
  tags: Arc<BTreeSet<String>>,
  metadata: Arc<Map<String, Value>>,
  params: Arc<Map<String, Value>>,
  run_name: Option<Arc<str>>,
  budget: ConcurrencyBudget,
  max_concurrency: usize,
  depth: usize,
  recursion_limit: usize,
  cancel: CancellationToken,
  parent_run_id: Option<Uuid>,
}

impl Default for RunContext {
  fn default() -> Self {
    Self::from_config(&RunConfig::default())
  }
}

impl fmt::Debug for RunContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunContext")
      .field("listeners", &self.bus.len())
      .field("tags", &self.tags)
      .field("metadata", &self.metadata)
      .field("params", &self.params)
      .field("max_concurrency", &self.max_concurrency)
      .field("depth", &self.depth)
      .field("recursion_limit", &self.recursion_limit)
      .field("cancelled", &self.cancel.is_cancelled())
      .field("parent_run_id", &self.parent_run_id)
      .finish()
  }
}

impl RunContext {
  /// Creates a fresh top-level context with default settings.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a fresh top-level context from `config`.
  ///
  /// A configured timeout arms a timer that cancels this context's signal.
  pub fn from_config(config: &RunConfig) -> Self {
    let limit = config
      .max_concurrency
      .unwrap_or_else(default_max_concurrency)
      .max(1);
    let ctx = Self {
      bus: EventBus::new(),
      tags: Arc::new(config.tags.clone()),
      metadata: Arc::new(config.metadata.clone()),
      params: Arc::new(Map::new()),
      run_name: config.run_name.as_deref().map(Arc::from),
      budget: ConcurrencyBudget::new(limit),
      max_concurrency: limit,
      depth: 0,
      recursion_limit: config.recursion_limit.unwrap_or(DEFAULT_RECURSION_LIMIT),
      cancel: CancellationToken::new(),
      parent_run_id: None,
    };
    match config.timeout() {
      Some(timeout) => ctx.with_timeout(timeout),
      None => ctx,
    }
  }

  /// Returns a context that also notifies `listener`.
  pub fn with_listener(&self, listener: impl Listener + 'static) -> Self {
    let mut ctx = self.clone();
    ctx.bus = self.bus.with_listener(Arc::new(listener));
    ctx
  }

  /// Returns a context with `tag` added.
  pub fn with_tag(&self, tag: impl Into<String>) -> Self {
    let mut tags = (*self.tags).clone();
    tags.insert(tag.into());
    let mut ctx = self.clone();
    ctx.tags = Arc::new(tags);
    ctx
  }

  /// Returns a context with a metadata entry added or replaced.
  pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    let mut metadata = (*self.metadata).clone();
    metadata.insert(key.into(), value.into());
    let mut ctx = self.clone();
    ctx.metadata = Arc::new(metadata);
    ctx
  }

  /// Returns a context whose bound parameters are extended with `params`.
  pub fn with_params(&self, params: &Map<String, Value>) -> Self {
    if params.is_empty() {
      return self.clone();
    }
    let mut merged = (*self.params).clone();
    for (key, value) in params {
      merged.insert(key.clone(), value.clone());
    }
    let mut ctx = self.clone();
    ctx.params = Arc::new(merged);
    ctx
  }

  /// Layers `config` over this context.
  ///
  /// Tags and metadata are extended, `max_concurrency` becomes the default cap
  /// for batches issued beneath this context (the shared budget is unchanged),
  /// `recursion_limit` replaces the ceiling and `timeout_ms` derives a timer.
  pub fn with_config(&self, config: &RunConfig) -> Self {
    let mut ctx = self.clone();
    if !config.tags.is_empty() {
      let mut tags = (*self.tags).clone();
      tags.extend(config.tags.iter().cloned());
      ctx.tags = Arc::new(tags);
    }
    if !config.metadata.is_empty() {
      let mut metadata = (*self.metadata).clone();
      for (key, value) in &config.metadata {
        metadata.insert(key.clone(), value.clone());
      }
      ctx.metadata = Arc::new(metadata);
    }
    if let Some(limit) = config.max_concurrency {
      ctx.max_concurrency = limit.max(1);
    }
    if let Some(limit) = config.recursion_limit {
      ctx.recursion_limit = limit;
    }
    if let Some(name) = &config.run_name {
      ctx.run_name = Some(Arc::from(name.as_str()));
    }
    match config.timeout() {
      Some(timeout) => ctx.with_timeout(timeout),
      None => ctx,
    }
  }

  /// Returns a context cancelled automatically once `timeout` elapses.
  ///
  /// The timer cancels a child of this context's signal, so the parent is not affected.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    let token = self.cancel.child_token();
    arm_timer(token.clone(), timeout);
    self.with_cancellation(token)
  }

  pub(crate) fn with_cancellation(&self, token: CancellationToken) -> Self {
    let mut ctx = self.clone();
    ctx.cancel = token;
    ctx
  }

  /// Sets the cancellation signal for this context and everything derived from it.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// True once the cancellation signal is set.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves when the cancellation signal is set.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await
  }

  /// The underlying cancellation token.
  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Tags visible to this context.
  pub fn tags(&self) -> &BTreeSet<String> {
    &self.tags
  }

  /// Metadata visible to this context.
  pub fn metadata(&self) -> &Map<String, Value> {
    &self.metadata
  }

  /// Bound parameters visible to this context.
  pub fn params(&self) -> &Map<String, Value> {
    &self.params
  }

  /// Looks up a bound parameter.
  pub fn param(&self, name: &str) -> Option<&Value> {
    self.params.get(name)
  }

  /// The shared concurrency budget.
  pub fn budget(&self) -> &ConcurrencyBudget {
    &self.budget
  }

  /// Default concurrency cap for batches and async fan-out under this context.
  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  /// Number of node entries above this context.
  pub fn depth(&self) -> usize {
    self.depth
  }

  /// Recursion ceiling.
  pub fn recursion_limit(&self) -> usize {
    self.recursion_limit
  }

  /// Run that owns this context, if any.
  pub fn parent_run_id(&self) -> Option<Uuid> {
    self.parent_run_id
  }

  /// The listeners notified by this context.
  pub fn bus(&self) -> &EventBus {
    &self.bus
  }

  /// Enters a node: emits `start`, checks the signal and the depth guard, and
  /// returns the run scope together with the context for the node's children.
  pub(crate) fn enter(
    &self,
    name: &str,
    kind: NodeKind,
    input: &Value,
  ) -> RunResult<(RunScope, RunContext)> {
    let name = self.run_name.as_deref().unwrap_or(name);
    let mut scope = self.open_scope(name, kind, || input.clone());
    if self.is_cancelled() {
      let err = RunError::Cancelled {
        node: name.to_string(),
      };
      scope.fail(&err);
      return Err(err);
    }
    let depth = self.depth + 1;
    if depth > self.recursion_limit {
      let err = RunError::RecursionLimit {
        limit: self.recursion_limit,
        node: name.to_string(),
      };
      scope.fail(&err);
      return Err(err);
    }
    trace!(run_id = %scope.run_id(), node = name, depth, "entering node");
    let child = self.child(scope.run_id(), depth);
    Ok((scope, child))
  }

  /// Opens the batch-level run that parents every item run of a batch.
  ///
  /// Batches are not nodes, so the depth is left unchanged.
  pub(crate) fn enter_batch(&self, name: &str, size: usize) -> RunResult<(RunScope, RunContext)> {
    let mut scope = self.open_scope(name, NodeKind::Batch, || json!({ "size": size }));
    if self.is_cancelled() {
      let err = RunError::Cancelled {
        node: name.to_string(),
      };
      scope.fail(&err);
      return Err(err);
    }
    let child = self.child(scope.run_id(), self.depth);
    Ok((scope, child))
  }

  fn open_scope(&self, name: &str, kind: NodeKind, input: impl FnOnce() -> Value) -> RunScope {
    RunScope::start(
      self.bus.clone(),
      self.parent_run_id,
      kind,
      name,
      &self.tags,
      &self.metadata,
      input,
    )
  }

  fn child(&self, run_id: Uuid, depth: usize) -> RunContext {
    let mut ctx = self.clone();
    ctx.parent_run_id = Some(run_id);
    ctx.depth = depth;
    ctx.run_name = None;
    ctx
  }
}

fn arm_timer(token: CancellationToken, timeout: Duration) {
  match tokio::runtime::Handle::try_current() {
    Ok(handle) => {
      handle.spawn(async move {
        tokio::select! {
          _ = tokio::time::sleep(timeout) => token.cancel(),
          _ = token.cancelled() => {}
        }
      });
    }
    Err(_) => {
      std::thread::spawn(move || {
        std::thread::sleep(timeout);
        token.cancel();
      });
    }
  }
}
