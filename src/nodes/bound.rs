//! Parameter and configuration binding.

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::RunResult;
use crate::node::{Capabilities, ChunkStream, Node, NodeKind, Runnable};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A node run with extra bound parameters and a configuration overlay.
///
/// Parameters are visible to every leaf beneath the bound node through
/// [`RunContext::param`]. The overlay's tags, metadata, recursion limit,
/// concurrency cap and timeout apply to the inner node's context; a run name,
/// if set, names the bound node itself in events.
pub struct Bound {
  name: String,
  inner: Node,
  params: Map<String, Value>,
  config: RunConfig,
}

impl Bound {
  /// Binds `params` and `config` to `inner`.
  pub fn new(inner: Node, params: Map<String, Value>, mut config: RunConfig) -> Self {
    let name = config
      .run_name
      .take()
      .unwrap_or_else(|| inner.name().to_string());
    Self {
      name,
      inner,
      params,
      config,
    }
  }

  /// The wrapped node.
  pub fn inner(&self) -> &Node {
    &self.inner
  }

  /// The bound parameters.
  pub fn params(&self) -> &Map<String, Value> {
    &self.params
  }

  fn scoped(&self, ctx: &RunContext) -> RunContext {
    ctx.with_params(&self.params).with_config(&self.config)
  }
}

#[async_trait]
impl Runnable for Bound {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Bound
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      transform: self.inner.capabilities().transform,
      ..Capabilities::STREAMING
    }
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    self.inner.invoke(input, &self.scoped(ctx))
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    self.inner.ainvoke(input, &self.scoped(ctx)).await
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    self.inner.astream(input, &self.scoped(&ctx))
  }

  fn atransform(self: Arc<Self>, input: ChunkStream, ctx: RunContext) -> ChunkStream {
    self.inner.atransform(input, &self.scoped(&ctx))
  }
}
