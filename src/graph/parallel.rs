//! Fan-out composition.

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::node::{Capabilities, ChunkStream, Node, NodeKind, Runnable};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Named branches run against the same input.
///
/// Synchronous invocation runs the branches one after another in declared
/// order. Asynchronous invocation runs them concurrently, at most
/// `max_concurrency` at a time; the first failure stops branches that have not
/// started yet, lets started ones finish, and surfaces the failure annotated
/// with its branch name.
pub struct Parallel {
  name: String,
  branches: Vec<(String, Node)>,
}

impl Parallel {
  /// Builds a parallel node. Fails on an empty branch list or a repeated name.
  pub(crate) fn new<S>(branches: impl IntoIterator<Item = (S, Node)>) -> RunResult<Self>
  where
    S: Into<String>,
  {
    let branches: Vec<(String, Node)> = branches
      .into_iter()
      .map(|(name, node)| (name.into(), node))
      .collect();
    if branches.is_empty() {
      return Err(RunError::InvalidComposition(
        "a parallel node needs at least 1 branch".to_string(),
      ));
    }
    let mut seen = HashSet::new();
    for (name, _) in &branches {
      if !seen.insert(name.as_str()) {
        return Err(RunError::InvalidComposition(format!(
          "duplicate branch name '{}'",
          name
        )));
      }
    }
    Ok(Self {
      name: "parallel".to_string(),
      branches,
    })
  }

  /// Branch names, in declared order.
  pub fn branch_names(&self) -> impl Iterator<Item = &str> {
    self.branches.iter().map(|(name, _)| name.as_str())
  }
}

fn tagged(branch: &str, chunk: Value) -> Value {
  let mut out = Map::new();
  out.insert(branch.to_string(), chunk);
  Value::Object(out)
}

#[async_trait]
impl Runnable for Parallel {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Parallel
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::STREAMING
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let mut out = Map::new();
    for (name, node) in &self.branches {
      let value = node
        .invoke(input.clone(), ctx)
        .map_err(|err| err.in_branch(name.as_str()))?;
      out.insert(name.clone(), value);
    }
    Ok(Value::Object(out))
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let stop = ctx.cancellation_token().child_token();
    let branch_ctx = ctx.with_cancellation(stop.clone());
    let calls: Vec<_> = self
      .branches
      .iter()
      .map(|(name, node)| {
        let (name, node) = (name.clone(), node.clone());
        let input = input.clone();
        let branch_ctx = branch_ctx.clone();
        async move {
          let result = node.ainvoke(input, &branch_ctx).await;
          (name, result)
        }
      })
      .collect();
    let mut pending = stream::iter(calls).buffer_unordered(ctx.max_concurrency());

    let mut out = Map::new();
    let mut failure: Option<RunError> = None;
    while let Some((name, result)) = pending.next().await {
      match result {
        Ok(value) => {
          out.insert(name, value);
        }
        Err(err) if failure.is_none() => {
          debug!(branch = %name, error = %err, "branch failed, stopping remaining branches");
          stop.cancel();
          failure = Some(err.in_branch(name.as_str()));
        }
        Err(_) => {}
      }
    }
    match failure {
      Some(err) => Err(err),
      None => Ok(Value::Object(out)),
    }
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    let stop = ctx.cancellation_token().child_token();
    let branch_ctx = ctx.with_cancellation(stop.clone());
    let streams: Vec<ChunkStream> = self
      .branches
      .iter()
      .map(|(name, node)| {
        let name = name.clone();
        node
          .astream(input.clone(), &branch_ctx)
          .map(move |item| match item {
            Ok(chunk) => Ok(tagged(&name, chunk)),
            Err(err) => Err(err.in_branch(name.as_str())),
          })
          .boxed()
      })
      .collect();
    Box::pin(try_stream! {
      let mut merged = stream::select_all(streams);
      while let Some(item) = merged.next().await {
        match item {
          Ok(chunk) => yield chunk,
          Err(err) => {
            stop.cancel();
            Err::<(), RunError>(err)?;
          }
        }
      }
    })
  }
}
