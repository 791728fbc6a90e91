//! Identity node.

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::graph::Parallel;
use crate::node::{Capabilities, ChunkStream, Node, NodeKind, Runnable};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Returns its input unchanged, or with derived keys merged in.
///
/// Without derived values the node consumes input incrementally: inside a
/// sequence each upstream chunk is forwarded as soon as it arrives. With
/// derived values the input must be an object; the derivations run as a
/// parallel node against the full input and their outputs overwrite keys of
/// the same name.
pub struct Passthrough {
  name: String,
  assign: Option<Node>,
}

impl Passthrough {
  /// Identity.
  pub fn new() -> Self {
    Self {
      name: "passthrough".to_string(),
      assign: None,
    }
  }

  /// Identity plus the outputs of `branches`, keyed by branch name.
  pub fn assign<S>(branches: impl IntoIterator<Item = (S, Node)>) -> RunResult<Self>
  where
    S: Into<String>,
  {
    Ok(Self {
      name: "passthrough_assign".to_string(),
      assign: Some(Node::new(Parallel::new(branches)?)),
    })
  }

  fn merge(&self, input: Value, derived: Value) -> RunResult<Value> {
    let (Value::Object(mut base), Value::Object(derived)) = (input, derived) else {
      return Err(RunError::leaf(format!(
        "{} expects an object input",
        self.name
      )));
    };
    base.extend(derived);
    Ok(Value::Object(base))
  }

  fn check_input(&self, input: &Value) -> RunResult<()> {
    if input.is_object() {
      Ok(())
    } else {
      Err(RunError::leaf(format!(
        "{} expects an object input, got {}",
        self.name,
        kind_of(input)
      )))
    }
  }
}

impl Default for Passthrough {
  fn default() -> Self {
    Self::new()
  }
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[async_trait]
impl Runnable for Passthrough {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Passthrough
  }

  fn capabilities(&self) -> Capabilities {
    match self.assign {
      Some(_) => Capabilities::ASYNC,
      None => Capabilities::TRANSFORM,
    }
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let Some(assign) = &self.assign else {
      return Ok(input);
    };
    self.check_input(&input)?;
    let derived = assign.invoke(input.clone(), ctx)?;
    self.merge(input, derived)
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let Some(assign) = &self.assign else {
      return Ok(input);
    };
    self.check_input(&input)?;
    let derived = assign.ainvoke(input.clone(), ctx).await?;
    self.merge(input, derived)
  }

  fn astream(self: Arc<Self>, input: Value, _ctx: RunContext) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Ok::<_, RunError>(input) }))
  }

  fn atransform(self: Arc<Self>, input: ChunkStream, _ctx: RunContext) -> ChunkStream {
    input
  }
}

/// Identity node.
pub fn passthrough() -> Node {
  Node::new(Passthrough::new())
}

/// Identity node that merges the outputs of `branches` into its object input.
pub fn passthrough_assign<S>(branches: impl IntoIterator<Item = (S, Node)>) -> RunResult<Node>
where
  S: Into<String>,
{
  Passthrough::assign(branches).map(Node::new)
}
