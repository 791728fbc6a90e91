//! # Streaming Fusion
//!
//! Helpers behind the streaming forms of the engine.
//!
//! ## Chunk accumulation
//!
//! Wherever chunks must be reduced to one complete value (the `end` payload of
//! a streamed run, a sequence boundary that cannot be fused, `invoke` on a
//! stream-native leaf) the same rule applies, see [`accumulate`].
//!
//! ## Fusion
//!
//! [`fuse_step`] connects one step of a sequence to the stream produced by the
//! steps before it. When the step consumes input incrementally each upstream
//! chunk is forwarded as soon as it is produced and the step's own chunks are
//! yielded as they arrive. Otherwise the upstream is buffered and reduced, and
//! the step runs once on the complete value.
//!
//! ## Blocking consumption
//!
//! [`ChunkIter`] exposes a chunk stream as a blocking iterator for callers that
//! are not running inside an async task.

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::execution::private_runtime;
use crate::node::{ChunkStream, Node};
use futures::{Stream, StreamExt};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::mpsc;

/// Merges `chunk` into `acc`.
///
/// Strings concatenate, arrays extend, objects merge key by key (recursively),
/// numbers add, `null` chunks leave the accumulated value untouched, and any
/// other combination keeps the later chunk.
pub fn accumulate(acc: Value, chunk: Value) -> Value {
  match (acc, chunk) {
    (acc, Value::Null) => acc,
    (Value::Null, chunk) => chunk,
    (Value::String(mut acc), Value::String(chunk)) => {
      acc.push_str(&chunk);
      Value::String(acc)
    }
    (Value::Array(mut acc), Value::Array(chunk)) => {
      acc.extend(chunk);
      Value::Array(acc)
    }
    (Value::Object(acc), Value::Object(chunk)) => Value::Object(merge_objects(acc, chunk)),
    (Value::Number(acc), Value::Number(chunk)) => Value::Number(add_numbers(&acc, &chunk)),
    (_, chunk) => chunk,
  }
}

fn merge_objects(mut acc: Map<String, Value>, chunk: Map<String, Value>) -> Map<String, Value> {
  for (key, value) in chunk {
    let merged = match acc.remove(&key) {
      Some(existing) => accumulate(existing, value),
      None => value,
    };
    acc.insert(key, merged);
  }
  acc
}

fn add_numbers(a: &Number, b: &Number) -> Number {
  if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
    if let Some(sum) = a.checked_add(b) {
      return Number::from(sum);
    }
  }
  let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
  Number::from_f64(sum).unwrap_or_else(|| b.clone())
}

/// Running reduction of a chunk sequence.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
  value: Option<Value>,
}

impl Accumulator {
  /// Starts an empty reduction.
  pub fn new() -> Self {
    Self::default()
  }

  /// Folds one chunk in.
  pub fn push(&mut self, chunk: Value) {
    self.value = Some(match self.value.take() {
      Some(acc) => accumulate(acc, chunk),
      None => chunk,
    });
  }

  /// The reduced value; `null` when no chunk was pushed.
  pub fn finish(self) -> Value {
    self.value.unwrap_or(Value::Null)
  }
}

/// Drains `chunks`, reducing them to one value. Stops at the first failure.
pub async fn collect_chunks<S>(chunks: S) -> RunResult<Value>
where
  S: Stream<Item = RunResult<Value>>,
{
  let mut chunks = std::pin::pin!(chunks);
  let mut acc = Accumulator::new();
  while let Some(chunk) = chunks.next().await {
    acc.push(chunk?);
  }
  Ok(acc.finish())
}

/// Connects sequence step `position` to the stream of the steps before it.
///
/// Failures raised by this step are annotated with its position; failures that
/// arrived from upstream already carry theirs and pass through untouched.
pub(crate) fn fuse_step(
  step: &Node,
  position: usize,
  upstream: ChunkStream,
  ctx: &RunContext,
) -> ChunkStream {
  let upstream_failed = Arc::new(AtomicBool::new(false));
  let flag = upstream_failed.clone();
  let upstream: ChunkStream = Box::pin(upstream.inspect(move |item| {
    if item.is_err() {
      flag.store(true, Ordering::SeqCst);
    }
  }));
  let name = step.name().to_string();
  Box::pin(step.atransform(upstream, ctx).map(move |item| {
    item.map_err(|err| {
      if upstream_failed.load(Ordering::SeqCst) {
        err
      } else {
        err.at_step(position, name.as_str())
      }
    })
  }))
}

/// Blocking iterator over a chunk stream.
///
/// Inside a multi-thread Tokio runtime each chunk is awaited on the ambient
/// runtime. Outside any runtime a private current-thread runtime is owned by
/// the iterator. Inside a current-thread runtime the stream is driven on a
/// helper thread that pulls the next chunk only when one is requested.
/// Dropping the iterator stops further chunks from being requested.
pub struct ChunkIter {
  driver: Driver,
}

enum Driver {
  Ambient(Handle, ChunkStream),
  Owned(Runtime, ChunkStream),
  Threaded(PullHandle),
  Failed(Option<RunError>),
}

impl ChunkIter {
  pub(crate) fn new(stream: ChunkStream) -> Self {
    let driver = match Handle::try_current() {
      Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
        Driver::Ambient(handle, stream)
      }
      Ok(_) => Driver::Threaded(spawn_driver(stream)),
      Err(_) => match private_runtime() {
        Ok(runtime) => Driver::Owned(runtime, stream),
        Err(err) => Driver::Failed(Some(err)),
      },
    };
    Self { driver }
  }

  /// Drains the remaining chunks and reduces them to one value.
  pub fn collect_value(self) -> RunResult<Value> {
    let mut acc = Accumulator::new();
    for chunk in self {
      acc.push(chunk?);
    }
    Ok(acc.finish())
  }
}

impl Iterator for ChunkIter {
  type Item = RunResult<Value>;

  fn next(&mut self) -> Option<Self::Item> {
    match &mut self.driver {
      Driver::Ambient(handle, stream) => {
        tokio::task::block_in_place(|| handle.block_on(stream.next()))
      }
      Driver::Owned(runtime, stream) => runtime.block_on(stream.next()),
      Driver::Threaded(pull) => pull.next(),
      Driver::Failed(err) => err.take().map(Err),
    }
  }
}

/// Request/response pair connecting a [`ChunkIter`] to its helper thread.
struct PullHandle {
  requests: mpsc::Sender<()>,
  chunks: mpsc::Receiver<RunResult<Value>>,
}

impl PullHandle {
  fn next(&mut self) -> Option<RunResult<Value>> {
    // At most one request is outstanding. A closed channel means the helper
    // has finished and only buffered output remains.
    let _ = self.requests.try_send(());
    // The caller sits inside a runtime context, where tokio's blocking
    // receive is refused.
    futures::executor::block_on(self.chunks.recv())
  }
}

fn spawn_driver(mut stream: ChunkStream) -> PullHandle {
  let (requests, mut pending) = mpsc::channel::<()>(1);
  let (chunks, received) = mpsc::channel(1);
  std::thread::spawn(move || {
    let runtime = match private_runtime() {
      Ok(runtime) => runtime,
      Err(err) => {
        let _ = chunks.try_send(Err(err));
        return;
      }
    };
    runtime.block_on(async move {
      while pending.recv().await.is_some() {
        let Some(chunk) = stream.next().await else {
          break;
        };
        if chunks.send(chunk).await.is_err() {
          break;
        }
      }
    });
  });
  PullHandle {
    requests,
    chunks: received,
  }
}
