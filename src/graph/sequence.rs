//! Sequential composition.

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::node::{Capabilities, ChunkStream, Node, NodeKind, Runnable};
use crate::streaming::fuse_step;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Ordered steps, each fed the previous step's output.
///
/// The first failing step aborts the sequence; its zero-based position and
/// name are attached to the surfaced error and later steps are never invoked.
pub struct Sequence {
  name: String,
  steps: Vec<Node>,
}

impl Sequence {
  /// Builds a sequence. Callers guarantee at least two steps.
  pub(crate) fn new(steps: Vec<Node>) -> Self {
    Self {
      name: "sequence".to_string(),
      steps,
    }
  }

  /// The steps, in order.
  pub fn steps(&self) -> &[Node] {
    &self.steps
  }
}

#[async_trait]
impl Runnable for Sequence {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Sequence
  }

  fn capabilities(&self) -> Capabilities {
    let transform = self
      .steps
      .first()
      .map(|step| step.capabilities().transform)
      .unwrap_or(false);
    Capabilities {
      async_native: true,
      streaming: true,
      transform,
    }
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let mut value = input;
    for (position, step) in self.steps.iter().enumerate() {
      value = step
        .invoke(value, ctx)
        .map_err(|err| err.at_step(position, step.name()))?;
    }
    Ok(value)
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let mut value = input;
    for (position, step) in self.steps.iter().enumerate() {
      value = step
        .ainvoke(value, ctx)
        .await
        .map_err(|err| err.at_step(position, step.name()))?;
    }
    Ok(value)
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    let Some((first, rest)) = self.steps.split_first() else {
      return Box::pin(stream::once(async move { Ok::<_, RunError>(input) }));
    };
    let first_name = first.name().to_string();
    let head: ChunkStream = Box::pin(
      first
        .astream(input, &ctx)
        .map(move |item| item.map_err(|err| err.at_step(0, first_name.as_str()))),
    );
    rest
      .iter()
      .enumerate()
      .fold(head, |upstream, (offset, step)| {
        fuse_step(step, offset + 1, upstream, &ctx)
      })
  }

  fn atransform(self: Arc<Self>, input: ChunkStream, ctx: RunContext) -> ChunkStream {
    self
      .steps
      .iter()
      .enumerate()
      .fold(input, |upstream, (position, step)| {
        fuse_step(step, position, upstream, &ctx)
      })
  }
}
