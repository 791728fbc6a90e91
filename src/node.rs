//! # Node Interface
//!
//! A node is one unit of computation: formatting a prompt, calling a model,
//! parsing output, looking up documents. Leaf authors implement [`Runnable`];
//! callers work with the cloneable [`Node`] handle, which is what gets composed
//! and executed.
//!
//! ## Capabilities
//!
//! A [`Runnable`] must supply a synchronous [`Runnable::invoke`]. Everything else
//! is optional and advertised through [`Capabilities`]:
//!
//! - `async_native`: [`Runnable::ainvoke`] suspends natively. Otherwise the engine
//!   runs `invoke` on a blocking worker when called asynchronously.
//! - `streaming`: [`Runnable::astream`] yields real increments. Otherwise the
//!   engine streams the whole result as a single chunk.
//! - `transform`: [`Runnable::atransform`] consumes its input incrementally, which
//!   lets a sequence fuse it with the step before it.
//!
//! Every calling form (`invoke`, `ainvoke`, `batch`, `abatch`, `stream`,
//! `astream`, `atransform`) is available on every [`Node`] regardless of which
//! capabilities the wrapped runnable declares.
//!
//! ## Variants
//!
//! The variant set is closed ([`NodeKind`]): leaves come from the adapters in
//! [`crate::nodes`], and composite variants are produced only by the operators
//! on [`Node`] and by [`sequence`] / [`parallel`].
//!
//! ## Example
//!
//! ```rust
//! use runweave::context::RunContext;
//! use runweave::node::{Node, parallel};
//! use runweave::nodes::{Lambda, passthrough};
//! use serde_json::{Value, json};
//!
//! let add_one = Node::new(Lambda::new("add_one", |v: Value| {
//!   Ok::<_, std::io::Error>(json!(v.as_i64().unwrap_or(0) + 1))
//! }));
//! let fan_out = parallel([("original", passthrough()), ("next", add_one.clone())]).unwrap();
//! let pipeline = add_one.pipe(fan_out);
//!
//! let out = pipeline.invoke(json!(1), &RunContext::new()).unwrap();
//! assert_eq!(out, json!({ "original": 2, "next": 3 }));
//! ```

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::graph::{Parallel, Sequence};
use crate::nodes::Bound;
use crate::retry::{RetryPolicy, Retrying};
use crate::streaming::collect_chunks;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Lazy sequence of output chunks.
///
/// Each call to a streaming form yields a fresh stream; consuming a chunk is destructive.
pub type ChunkStream = BoxStream<'static, RunResult<Value>>;

/// The closed set of node variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
  /// Wraps a user function or external call.
  Leaf,
  /// Pipes each step's output into the next step.
  Sequence,
  /// Fans one input out to named branches.
  Parallel,
  /// A node with bound parameters or configuration.
  Bound,
  /// A node under a retry policy with an optional fallback.
  Retrying,
  /// Identity, optionally merging derived values into the input.
  Passthrough,
  /// The batch-level run that parents the item runs of a batch.
  Batch,
}

impl fmt::Display for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      NodeKind::Leaf => "leaf",
      NodeKind::Sequence => "sequence",
      NodeKind::Parallel => "parallel",
      NodeKind::Bound => "bound",
      NodeKind::Retrying => "retrying",
      NodeKind::Passthrough => "passthrough",
      NodeKind::Batch => "batch",
    };
    write!(f, "{}", name)
  }
}

/// Native capabilities declared by a runnable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
  /// `ainvoke` suspends natively instead of needing a blocking worker.
  pub async_native: bool,
  /// `astream` yields incremental chunks.
  pub streaming: bool,
  /// `atransform` consumes input incrementally.
  pub transform: bool,
}

impl Capabilities {
  /// Only a synchronous `invoke`.
  pub const SYNC: Capabilities = Capabilities {
    async_native: false,
    streaming: false,
    transform: false,
  };

  /// Native async invocation, no streaming.
  pub const ASYNC: Capabilities = Capabilities {
    async_native: true,
    streaming: false,
    transform: false,
  };

  /// Native async invocation and streaming output.
  pub const STREAMING: Capabilities = Capabilities {
    async_native: true,
    streaming: true,
    transform: false,
  };

  /// Native async invocation, streaming output and incremental input.
  pub const TRANSFORM: Capabilities = Capabilities {
    async_native: true,
    streaming: true,
    transform: true,
  };
}

/// Behavior of a node.
///
/// Implementations receive a context that has already been entered: events,
/// the recursion guard, the cancellation check and the concurrency budget are
/// handled by [`Node`]. Composite runnables call their children through the
/// child [`Node`]s with the context they were given.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
  /// Name reported in events and errors.
  fn name(&self) -> &str;

  /// Variant of this runnable.
  fn kind(&self) -> NodeKind {
    NodeKind::Leaf
  }

  /// Native capabilities.
  fn capabilities(&self) -> Capabilities {
    Capabilities::SYNC
  }

  /// Synchronous single-item execution.
  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value>;

  /// Asynchronous single-item execution.
  ///
  /// Only called when `capabilities().async_native` is set.
  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    self.invoke(input, ctx)
  }

  /// Incremental output.
  ///
  /// Only called when `capabilities().streaming` is set.
  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    Box::pin(stream::once(
      async move { self.ainvoke(input, &ctx).await },
    ))
  }

  /// Incremental input and output.
  ///
  /// Only called when `capabilities().transform` is set. The default buffers the
  /// whole input and streams the result of a single call.
  fn atransform(self: Arc<Self>, input: ChunkStream, ctx: RunContext) -> ChunkStream {
    Box::pin(try_stream! {
      let value = collect_chunks(input).await?;
      let mut chunks = self.astream(value, ctx);
      while let Some(chunk) = chunks.next().await {
        yield chunk?;
      }
    })
  }
}

/// Cloneable handle to an immutable node.
///
/// Composition never mutates an operand: every operator returns a new node.
#[derive(Clone)]
pub struct Node {
  runnable: Arc<dyn Runnable>,
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Node")
      .field("name", &self.name())
      .field("kind", &self.kind())
      .field("capabilities", &self.capabilities())
      .finish()
  }
}

impl<R: Runnable> From<R> for Node {
  fn from(runnable: R) -> Self {
    Node::new(runnable)
  }
}

impl Node {
  /// Wraps a runnable.
  pub fn new<R: Runnable>(runnable: R) -> Self {
    Self {
      runnable: Arc::new(runnable),
    }
  }

  /// Wraps an already shared runnable.
  pub fn from_arc(runnable: Arc<dyn Runnable>) -> Self {
    Self { runnable }
  }

  /// Name of the wrapped runnable.
  pub fn name(&self) -> &str {
    self.runnable.name()
  }

  /// Variant of the wrapped runnable.
  pub fn kind(&self) -> NodeKind {
    self.runnable.kind()
  }

  /// Native capabilities of the wrapped runnable.
  pub fn capabilities(&self) -> Capabilities {
    self.runnable.capabilities()
  }

  pub(crate) fn runnable(&self) -> &Arc<dyn Runnable> {
    &self.runnable
  }

  /// Returns `self | next`: a sequence feeding this node's output into `next`.
  pub fn pipe(&self, next: impl Into<Node>) -> Node {
    Node::new(Sequence::new(vec![self.clone(), next.into()]))
  }

  /// Returns a node that exposes `params` to every leaf beneath it.
  pub fn bind(&self, params: Map<String, Value>) -> Node {
    Node::new(Bound::new(self.clone(), params, RunConfig::default()))
  }

  /// Returns a node that layers `config` over the context it is called with.
  pub fn with_config(&self, config: RunConfig) -> Node {
    Node::new(Bound::new(self.clone(), Map::new(), config))
  }

  /// Returns a node that retries this one under `policy`.
  pub fn with_retry(&self, policy: RetryPolicy) -> Node {
    Node::new(Retrying::new(self.clone(), policy, None))
  }

  /// Returns a node that calls `fallback` once if this one fails.
  pub fn with_fallback(&self, fallback: impl Into<Node>) -> Node {
    Node::new(Retrying::new(
      self.clone(),
      RetryPolicy::new(1),
      Some(fallback.into()),
    ))
  }

  /// Returns a node that retries this one under `policy`, then calls `fallback` once.
  pub fn with_retry_and_fallback(&self, policy: RetryPolicy, fallback: impl Into<Node>) -> Node {
    Node::new(Retrying::new(self.clone(), policy, Some(fallback.into())))
  }
}

/// Composes two or more nodes into a sequence.
pub fn sequence(steps: impl IntoIterator<Item = Node>) -> RunResult<Node> {
  let steps: Vec<Node> = steps.into_iter().collect();
  if steps.len() < 2 {
    return Err(RunError::InvalidComposition(format!(
      "a sequence needs at least 2 steps, got {}",
      steps.len()
    )));
  }
  Ok(Node::new(Sequence::new(steps)))
}

/// Composes named branches into a parallel node, in declared order.
pub fn parallel<S>(branches: impl IntoIterator<Item = (S, Node)>) -> RunResult<Node>
where
  S: Into<String>,
{
  Parallel::new(branches).map(Node::new)
}
