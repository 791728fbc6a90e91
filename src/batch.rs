//! # Batching Scheduler
//!
//! Applies one node to many independent inputs. Results are positionally
//! aligned with the inputs whatever order the items complete in.
//!
//! By default a failed item is captured in its slot and the batch as a whole
//! succeeds; [`into_values`] turns a mixed result list into
//! [`RunError::BatchPartialFailure`] when the caller wants all or nothing. With
//! [`BatchOptions::fail_fast`] the first failure stops items that have not
//! started yet and is raised directly.
//!
//! Every batch opens a batch-level run ([`NodeKind::Batch`](crate::node::NodeKind))
//! that parents the item runs, so a trace reconstructs one sub-tree per item
//! under the batch.
//!
//! ## Example
//!
//! ```rust
//! use runweave::batch::BatchOptions;
//! use runweave::context::RunContext;
//! use runweave::node::Node;
//! use runweave::nodes::Lambda;
//! use serde_json::{Value, json};
//!
//! let square = Node::new(Lambda::new("square", |v: Value| {
//!   let n = v.as_i64().ok_or("not a number")?;
//!   Ok::<_, &str>(json!(n * n))
//! }));
//! let results = square
//!   .batch(vec![json!(2), json!("x"), json!(3)], &RunContext::new(), &BatchOptions::default())
//!   .unwrap();
//! assert_eq!(results[0].as_ref().unwrap(), &json!(4));
//! assert!(results[1].is_err());
//! assert_eq!(results[2].as_ref().unwrap(), &json!(9));
//! ```

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::events::RunScope;
use crate::node::Node;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Per-call batch settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
  /// Items in flight at once. Defaults to the context's `max_concurrency`.
  pub max_concurrency: Option<usize>,
  /// Raise the first failure instead of collecting per-item results.
  pub fail_fast: bool,
}

impl BatchOptions {
  /// Default options.
  pub fn new() -> Self {
    Self::default()
  }

  /// Caps the number of items in flight.
  pub fn with_max_concurrency(mut self, limit: usize) -> Self {
    self.max_concurrency = Some(limit);
    self
  }

  /// Enables fail-fast semantics.
  pub fn fail_fast(mut self) -> Self {
    self.fail_fast = true;
    self
  }

  fn limit(&self, ctx: &RunContext, items: usize) -> usize {
    self
      .max_concurrency
      .unwrap_or_else(|| ctx.max_concurrency())
      .clamp(1, items.max(1))
  }
}

/// Converts aligned batch results into values, failing if any item failed.
pub fn into_values(results: Vec<RunResult<Value>>) -> RunResult<Vec<Value>> {
  let failed = results.iter().filter(|result| result.is_err()).count();
  if failed > 0 {
    return Err(RunError::BatchPartialFailure {
      failed,
      total: results.len(),
      results,
    });
  }
  Ok(results.into_iter().flatten().collect())
}

impl Node {
  /// Runs the node over `inputs` on a pool of scoped worker threads.
  ///
  /// Returns per-item results aligned with `inputs`. Fails as a whole only when
  /// the context is already cancelled or, with fail-fast, on the first item
  /// failure.
  pub fn batch(
    &self,
    inputs: Vec<Value>,
    ctx: &RunContext,
    options: &BatchOptions,
  ) -> RunResult<Vec<RunResult<Value>>> {
    let total = inputs.len();
    let (mut scope, batch_ctx) = ctx.enter_batch(self.name(), total)?;
    let stop = batch_ctx.cancellation_token().child_token();
    let item_ctx = batch_ctx.with_cancellation(stop.clone());
    let workers = options.limit(ctx, total);
    debug!(node = %self.name(), items = total, workers, "running batch");

    let next = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<RunResult<Value>>>> =
      (0..total).map(|_| Mutex::new(None)).collect();
    let inputs: Vec<Mutex<Option<Value>>> =
      inputs.into_iter().map(|input| Mutex::new(Some(input))).collect();
    let first_failure = Mutex::new(None::<usize>);

    std::thread::scope(|threads| {
      for _ in 0..workers.min(total) {
        threads.spawn(|| {
          loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            if index >= total {
              break;
            }
            let input = take_slot(&inputs[index]).unwrap_or(Value::Null);
            let result = catch_unwind(AssertUnwindSafe(|| self.invoke(input, &item_ctx)))
              .unwrap_or_else(|panic| Err(RunError::Worker(panic_message(panic.as_ref()))));
            if result.is_err() && options.fail_fast {
              if let Ok(mut first) = first_failure.lock() {
                first.get_or_insert(index);
              }
              stop.cancel();
            }
            if let Ok(mut slot) = slots[index].lock() {
              *slot = Some(result);
            }
          }
        });
      }
    });

    let mut results: Vec<RunResult<Value>> = slots
      .into_iter()
      .map(|slot| {
        slot
          .into_inner()
          .ok()
          .flatten()
          .unwrap_or_else(|| Err(not_run()))
      })
      .collect();
    let first = first_failure.into_inner().ok().flatten();
    finish_batch(&mut scope, &mut results, first, total)
  }

  /// Runs the node over `inputs` concurrently.
  ///
  /// Same result semantics as [`Node::batch`]; items are scheduled as async
  /// tasks with at most the configured number in flight.
  pub async fn abatch(
    &self,
    inputs: Vec<Value>,
    ctx: &RunContext,
    options: &BatchOptions,
  ) -> RunResult<Vec<RunResult<Value>>> {
    let total = inputs.len();
    let (mut scope, batch_ctx) = ctx.enter_batch(self.name(), total)?;
    let stop = batch_ctx.cancellation_token().child_token();
    let item_ctx = batch_ctx.with_cancellation(stop.clone());
    let workers = options.limit(ctx, total);
    debug!(node = %self.name(), items = total, workers, "running async batch");

    let mut pending = stream::iter(inputs.into_iter().enumerate())
      .map(|(index, input)| {
        let item_ctx = item_ctx.clone();
        async move { (index, self.ainvoke(input, &item_ctx).await) }
      })
      .buffer_unordered(workers);

    let mut slots: Vec<Option<RunResult<Value>>> = (0..total).map(|_| None).collect();
    let mut first = None;
    while let Some((index, result)) = pending.next().await {
      if result.is_err() && options.fail_fast && first.is_none() {
        first = Some(index);
        stop.cancel();
      }
      slots[index] = Some(result);
    }

    let mut results: Vec<RunResult<Value>> = slots
      .into_iter()
      .map(|slot| slot.unwrap_or_else(|| Err(not_run())))
      .collect();
    finish_batch(&mut scope, &mut results, first, total)
  }

  /// Runs the node over `inputs` concurrently, yielding `(index, result)` pairs
  /// in completion order.
  pub fn abatch_as_completed(
    &self,
    inputs: Vec<Value>,
    ctx: &RunContext,
    options: &BatchOptions,
  ) -> BoxStream<'static, (usize, RunResult<Value>)> {
    let node = self.clone();
    let ctx = ctx.clone();
    let options = options.clone();
    let total = inputs.len();
    Box::pin(async_stream::stream! {
      let (mut scope, batch_ctx) = match ctx.enter_batch(node.name(), total) {
        Ok(entered) => entered,
        Err(err) => {
          for index in 0..total {
            yield (index, Err(RunError::Cancelled { node: node.name().to_string() }));
          }
          debug!(error = %err, "batch not started");
          return;
        }
      };
      let stop = batch_ctx.cancellation_token().child_token();
      let item_ctx = batch_ctx.with_cancellation(stop.clone());
      let workers = options.limit(&ctx, total);
      let mut pending = stream::iter(inputs.into_iter().enumerate())
        .map(|(index, input)| {
          let node = node.clone();
          let item_ctx = item_ctx.clone();
          async move { (index, node.ainvoke(input, &item_ctx).await) }
        })
        .buffer_unordered(workers);
      let mut failed = 0;
      while let Some((index, result)) = pending.next().await {
        if result.is_err() {
          failed += 1;
          if options.fail_fast {
            stop.cancel();
          }
        }
        yield (index, result);
      }
      scope.end(&json!({ "size": total, "failed": failed }));
    })
  }
}

fn not_run() -> RunError {
  RunError::Worker("batch item was not run".to_string())
}

fn take_slot(slot: &Mutex<Option<Value>>) -> Option<Value> {
  slot.lock().ok().and_then(|mut value| value.take())
}

fn finish_batch(
  scope: &mut RunScope,
  results: &mut Vec<RunResult<Value>>,
  first_failure: Option<usize>,
  total: usize,
) -> RunResult<Vec<RunResult<Value>>> {
  if let Some(index) = first_failure {
    let err = match results.get_mut(index) {
      Some(slot) => std::mem::replace(slot, Ok(Value::Null)).err(),
      None => None,
    };
    let err = err.unwrap_or_else(|| RunError::Worker("batch item failed".to_string()));
    scope.fail(&err);
    return Err(err);
  }
  let failed = results.iter().filter(|result| result.is_err()).count();
  scope.end(&json!({ "size": total, "failed": failed }));
  Ok(std::mem::take(results))
}

/// Describes a panic payload caught on a batch worker.
fn panic_message(payload: &(dyn Any + Send)) -> String {
  let detail = payload
    .downcast_ref::<&str>()
    .map(|msg| msg.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string());
  format!("batch item panicked: {}", detail)
}
