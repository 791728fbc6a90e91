//! # Execution Engine
//!
//! The calling forms of [`Node`]. Every form enters the node through the
//! context (which emits `start`, checks the cancellation signal and the
//! recursion guard), acquires a permit from the shared concurrency budget for
//! leaf invocations, dispatches to the runnable, and reports exactly one
//! terminal event.
//!
//! Derivations applied uniformly, whatever the runnable implements natively:
//!
//! - `ainvoke` on a runnable that is not async-native runs `invoke` on a
//!   blocking worker, so the caller's scheduler is never blocked.
//! - `astream` on a runnable that does not stream yields the whole result as a
//!   single chunk.
//! - `atransform` on a runnable without incremental input buffers the upstream
//!   chunks, reduces them to one value, and then enters the node once.
//! - `stream` drives `astream` to completion from a blocking caller.
//!
//! Async leaves invoked through the blocking forms are driven by [`block_on`],
//! which reuses the ambient Tokio runtime when it can and falls back to a
//! private current-thread runtime otherwise.

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::node::{ChunkStream, Node, NodeKind};
use crate::streaming::{Accumulator, ChunkIter, collect_chunks};
use async_stream::try_stream;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use std::future::Future;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::OwnedSemaphorePermit;

impl Node {
  /// Runs the node once, blocking the calling thread until it finishes.
  ///
  /// Fails with the node's own error, [`RunError::RecursionLimit`] when the
  /// depth guard trips, or [`RunError::Cancelled`] when the signal is set.
  pub fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let (mut scope, run_ctx) = ctx.enter(self.name(), self.kind(), &input)?;
    let result = self
      .leaf_permit_blocking(&run_ctx)
      .and_then(|_permit| self.runnable().invoke(input, &run_ctx));
    scope.finish(&result);
    result
  }

  /// Runs the node once without blocking the caller's scheduler.
  pub async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let (mut scope, run_ctx) = ctx.enter(self.name(), self.kind(), &input)?;
    let result = match self.leaf_permit(&run_ctx).await {
      Ok(_permit) => self.call_entered(input, &run_ctx).await,
      Err(err) => Err(err),
    };
    scope.finish(&result);
    result
  }

  /// Streams the node's output, one chunk per increment.
  ///
  /// Each call yields a fresh stream. A failure is yielded in place of the next
  /// chunk and ends the stream. Dropping the stream stops the engine from
  /// requesting further chunks.
  pub fn astream(&self, input: Value, ctx: &RunContext) -> ChunkStream {
    let node = self.clone();
    let ctx = ctx.clone();
    Box::pin(try_stream! {
      let (mut scope, run_ctx) = ctx.enter(node.name(), node.kind(), &input)?;
      let _permit = match node.leaf_permit(&run_ctx).await {
        Ok(permit) => permit,
        Err(err) => {
          scope.fail(&err);
          Err(err)?
        }
      };
      let mut chunks = node.chunks_entered(input, run_ctx);
      let mut output = Accumulator::new();
      while let Some(item) = chunks.next().await {
        match item {
          Ok(chunk) => {
            scope.chunk(&chunk);
            output.push(chunk.clone());
            yield chunk;
          }
          Err(err) => {
            scope.fail(&err);
            Err::<(), RunError>(err)?;
          }
        }
      }
      scope.end(&output.finish());
    })
  }

  /// Blocking counterpart of [`Node::astream`]: an iterator over chunks.
  pub fn stream(&self, input: Value, ctx: &RunContext) -> ChunkIter {
    ChunkIter::new(self.astream(input, ctx))
  }

  /// Streams the node's output for an incrementally produced input.
  ///
  /// Nodes that consume input incrementally receive each upstream chunk as it
  /// arrives. Any other node waits for the upstream to finish, receives the
  /// reduced value, and is entered exactly once.
  pub fn atransform(&self, input: ChunkStream, ctx: &RunContext) -> ChunkStream {
    if !self.capabilities().transform {
      let node = self.clone();
      let ctx = ctx.clone();
      return Box::pin(try_stream! {
        let value = collect_chunks(input).await?;
        let mut chunks = node.astream(value, &ctx);
        while let Some(chunk) = chunks.next().await {
          yield chunk?;
        }
      });
    }

    let node = self.clone();
    let ctx = ctx.clone();
    Box::pin(try_stream! {
      let (mut scope, run_ctx) = ctx.enter(node.name(), node.kind(), &Value::Null)?;
      let _permit = match node.leaf_permit(&run_ctx).await {
        Ok(permit) => permit,
        Err(err) => {
          scope.fail(&err);
          Err(err)?
        }
      };
      let mut chunks = node.runnable().clone().atransform(input, run_ctx);
      let mut output = Accumulator::new();
      while let Some(item) = chunks.next().await {
        match item {
          Ok(chunk) => {
            scope.chunk(&chunk);
            output.push(chunk.clone());
            yield chunk;
          }
          Err(err) => {
            scope.fail(&err);
            Err::<(), RunError>(err)?;
          }
        }
      }
      scope.end(&output.finish());
    })
  }

  /// Dispatches an already entered call on the async path.
  pub(crate) async fn call_entered(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    if self.capabilities().async_native {
      return self.runnable().ainvoke(input, ctx).await;
    }
    let runnable = self.runnable().clone();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || runnable.invoke(input, &ctx))
      .await
      .map_err(|err| RunError::Worker(err.to_string()))?
  }

  fn chunks_entered(&self, input: Value, ctx: RunContext) -> ChunkStream {
    if self.capabilities().streaming {
      return self.runnable().clone().astream(input, ctx);
    }
    let node = self.clone();
    Box::pin(stream::once(async move {
      node.call_entered(input, &ctx).await
    }))
  }

  async fn leaf_permit(&self, ctx: &RunContext) -> RunResult<Option<OwnedSemaphorePermit>> {
    if self.kind() != NodeKind::Leaf {
      return Ok(None);
    }
    ctx.budget().acquire().await.map(Some)
  }

  fn leaf_permit_blocking(&self, ctx: &RunContext) -> RunResult<Option<OwnedSemaphorePermit>> {
    if self.kind() != NodeKind::Leaf {
      return Ok(None);
    }
    ctx.budget().acquire_blocking().map(Some)
  }
}

/// Drives `future` to completion from a blocking caller.
///
/// On a multi-thread Tokio runtime the future runs on the ambient runtime via
/// `block_in_place`. Inside a current-thread runtime it runs on a scoped helper
/// thread with its own runtime, and outside any runtime on a private
/// current-thread runtime.
pub fn block_on<F>(future: F) -> RunResult<F::Output>
where
  F: Future + Send,
  F::Output: Send,
{
  match Handle::try_current() {
    Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
      Ok(tokio::task::block_in_place(|| handle.block_on(future)))
    }
    Ok(_) => std::thread::scope(|scope| {
      scope
        .spawn(|| private_runtime().map(|runtime| runtime.block_on(future)))
        .join()
        .map_err(|_| RunError::Worker("blocking driver panicked".to_string()))?
    }),
    Err(_) => Ok(private_runtime()?.block_on(future)),
  }
}

pub(crate) fn private_runtime() -> RunResult<tokio::runtime::Runtime> {
  tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .map_err(RunError::from)
}
