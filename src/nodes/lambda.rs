//! Closure-backed leaves.
//!
//! Every adapter comes in two flavors: `new` takes a closure over the input
//! only, `with_context` also hands the closure the entered [`RunContext`] so it
//! can read bound parameters or watch the cancellation signal. Closure errors
//! may be any type convertible into [`BoxError`].

use crate::context::RunContext;
use crate::error::{BoxError, RunError, RunResult};
use crate::execution::block_on;
use crate::node::{Capabilities, ChunkStream, Runnable};
use crate::streaming::collect_chunks;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

type SyncFn = dyn Fn(Value, &RunContext) -> RunResult<Value> + Send + Sync;
type AsyncFn = dyn Fn(Value, RunContext) -> BoxFuture<'static, RunResult<Value>> + Send + Sync;
type StreamFn = dyn Fn(Value, RunContext) -> ChunkStream + Send + Sync;
type TransformFn = dyn Fn(ChunkStream, RunContext) -> ChunkStream + Send + Sync;

fn leaf_chunks<S, E>(chunks: S) -> ChunkStream
where
  S: Stream<Item = Result<Value, E>> + Send + 'static,
  E: Into<BoxError>,
{
  Box::pin(chunks.map(|item| item.map_err(RunError::leaf)))
}

/// Leaf wrapping a synchronous closure.
pub struct Lambda {
  name: String,
  func: Box<SyncFn>,
}

impl Lambda {
  /// Wraps `func(input)`.
  pub fn new<F, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value) -> Result<Value, E> + Send + Sync + 'static,
    E: Into<BoxError>,
  {
    Self::with_context(name, move |input, _: &RunContext| func(input))
  }

  /// Wraps `func(input, ctx)`.
  pub fn with_context<F, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value, &RunContext) -> Result<Value, E> + Send + Sync + 'static,
    E: Into<BoxError>,
  {
    Self {
      name: name.into(),
      func: Box::new(move |input: Value, ctx: &RunContext| {
        func(input, ctx).map_err(RunError::leaf)
      }),
    }
  }
}

#[async_trait]
impl Runnable for Lambda {
  fn name(&self) -> &str {
    &self.name
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    (self.func)(input, ctx)
  }
}

/// Leaf wrapping a closure that returns a future.
///
/// Called synchronously, the future is driven to completion on the calling thread.
pub struct AsyncLambda {
  name: String,
  func: Box<AsyncFn>,
}

impl AsyncLambda {
  /// Wraps `func(input).await`.
  pub fn new<F, Fut, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::with_context(name, move |input, _: RunContext| func(input))
  }

  /// Wraps `func(input, ctx).await`.
  pub fn with_context<F, Fut, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self {
      name: name.into(),
      func: Box::new(move |input: Value, ctx: RunContext| {
        let pending = func(input, ctx);
        async move { pending.await.map_err(RunError::leaf) }.boxed()
      }),
    }
  }
}

#[async_trait]
impl Runnable for AsyncLambda {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::ASYNC
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    block_on((self.func)(input, ctx.clone()))?
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    (self.func)(input, ctx.clone()).await
  }
}

/// Leaf wrapping a closure that streams its output.
///
/// Invoked rather than streamed, the chunks are reduced to one value.
pub struct StreamingLambda {
  name: String,
  func: Box<StreamFn>,
}

impl StreamingLambda {
  /// Wraps a closure producing the output chunks for `input`.
  pub fn new<F, S, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::with_context(name, move |input, _: RunContext| func(input))
  }

  /// Wraps a closure producing the output chunks for `input` under `ctx`.
  pub fn with_context<F, S, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Value, RunContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self {
      name: name.into(),
      func: Box::new(move |input: Value, ctx: RunContext| leaf_chunks(func(input, ctx))),
    }
  }
}

#[async_trait]
impl Runnable for StreamingLambda {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::STREAMING
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    block_on(collect_chunks((self.func)(input, ctx.clone())))?
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    collect_chunks((self.func)(input, ctx.clone())).await
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    (self.func)(input, ctx)
  }
}

/// Leaf mapping an input chunk stream to an output chunk stream.
///
/// Inside a sequence each chunk produced by the previous step reaches the
/// generator as soon as it is produced. A single input value is presented as a
/// one-chunk stream.
pub struct Generator {
  name: String,
  func: Box<TransformFn>,
}

impl Generator {
  /// Wraps a closure from input chunks to output chunks.
  pub fn new<F, S, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(ChunkStream) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::with_context(name, move |input, _: RunContext| func(input))
  }

  /// Wraps a closure from input chunks to output chunks under `ctx`.
  pub fn with_context<F, S, E>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(ChunkStream, RunContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self {
      name: name.into(),
      func: Box::new(move |input: ChunkStream, ctx: RunContext| {
        leaf_chunks(func(input, ctx))
      }),
    }
  }

  fn single(&self, input: Value, ctx: RunContext) -> ChunkStream {
    (self.func)(Box::pin(stream::once(async move { Ok::<_, RunError>(input) })), ctx)
  }
}

#[async_trait]
impl Runnable for Generator {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::TRANSFORM
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    block_on(collect_chunks(self.single(input, ctx.clone())))?
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    collect_chunks(self.single(input, ctx.clone())).await
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    self.single(input, ctx)
  }

  fn atransform(self: Arc<Self>, input: ChunkStream, ctx: RunContext) -> ChunkStream {
    (self.func)(input, ctx)
  }
}
