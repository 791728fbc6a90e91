//! # Node Adapter Test Suite
//!
//! Closure adapters, passthrough with derived values, and binding of
//! parameters and configuration.

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::RunError;
use crate::events::{EventRecorder, Phase};
use crate::node::{Capabilities, ChunkStream, Node, NodeKind};
use crate::nodes::{AsyncLambda, Generator, Lambda, StreamingLambda, passthrough, passthrough_assign};
use futures::{StreamExt, stream};
use serde_json::{Map, Value, json};
use std::sync::Arc;

fn greet() -> Node {
  Node::new(Lambda::with_context("greet", |v: Value, ctx: &RunContext| {
    let greeting = ctx
      .param("greeting")
      .and_then(Value::as_str)
      .unwrap_or("hello")
      .to_string();
    Ok::<_, RunError>(json!(format!("{}, {}", greeting, v.as_str().unwrap_or("?"))))
  }))
}

#[test]
fn test_adapter_capabilities() {
  let lambda = Node::new(Lambda::new("l", |v: Value| Ok::<_, RunError>(v)));
  let async_lambda = Node::new(AsyncLambda::new("a", |v: Value| async move { Ok::<_, RunError>(v) }));
  let streaming = Node::new(StreamingLambda::new("s", |v: Value| {
    stream::iter(vec![Ok::<_, RunError>(v)])
  }));
  let generator = Node::new(Generator::new("g", |input: ChunkStream| input));

  assert_eq!(lambda.capabilities(), Capabilities::SYNC);
  assert_eq!(async_lambda.capabilities(), Capabilities::ASYNC);
  assert_eq!(streaming.capabilities(), Capabilities::STREAMING);
  assert_eq!(generator.capabilities(), Capabilities::TRANSFORM);
  assert_eq!(passthrough().capabilities(), Capabilities::TRANSFORM);
  assert_eq!(lambda.kind(), NodeKind::Leaf);
  assert_eq!(passthrough().kind(), NodeKind::Passthrough);
}

#[test]
fn test_streaming_lambda_invoke_accumulates() {
  let words = Node::new(StreamingLambda::new("words", |_: Value| {
    stream::iter(vec![Ok::<_, RunError>(json!("to")), Ok(json!("ken"))])
  }));
  assert_eq!(words.invoke(json!(null), &RunContext::new()).unwrap(), json!("token"));
}

#[tokio::test]
async fn test_streaming_lambda_error_mid_stream() {
  let recorder = Arc::new(EventRecorder::new());
  let ctx = RunContext::new().with_listener(recorder.clone());
  let broken = Node::new(StreamingLambda::new("broken", |_: Value| {
    stream::iter(vec![Ok(json!(1)), Err("connection reset")])
  }));
  let results: Vec<_> = broken.astream(json!(null), &ctx).collect().await;
  assert_eq!(results.len(), 2);
  assert_eq!(results[1].as_ref().unwrap_err().to_string(), "connection reset");
  assert_eq!(recorder.count("broken", Phase::Chunk), 1);
  assert_eq!(recorder.count("broken", Phase::Error), 1);
}

#[test]
fn test_generator_invoke_sees_single_chunk() {
  let count = Node::new(Generator::new("count", |input: ChunkStream| {
    stream::once(async move {
      let chunks: Vec<_> = input.collect().await;
      Ok::<_, RunError>(json!(chunks.len()))
    })
  }));
  assert_eq!(count.invoke(json!("x"), &RunContext::new()).unwrap(), json!(1));
}

#[tokio::test]
async fn test_context_aware_async_lambda() {
  let node = Node::new(AsyncLambda::with_context("tagged", |_: Value, ctx: RunContext| async move {
    Ok::<_, RunError>(json!(ctx.tags().iter().cloned().collect::<Vec<_>>()))
  }));
  let ctx = RunContext::new().with_tag("beta");
  assert_eq!(node.ainvoke(json!(null), &ctx).await.unwrap(), json!(["beta"]));
}

#[test]
fn test_passthrough_is_identity() {
  let ctx = RunContext::new();
  assert_eq!(passthrough().invoke(json!({ "k": [1, 2] }), &ctx).unwrap(), json!({ "k": [1, 2] }));
  assert_eq!(passthrough().invoke(json!("text"), &ctx).unwrap(), json!("text"));
}

#[tokio::test]
async fn test_passthrough_assign_merges_derived_values() {
  let length = Node::new(Lambda::new("length", |v: Value| {
    Ok::<_, RunError>(json!(v["text"].as_str().unwrap_or_default().len()))
  }));
  let enrich = passthrough_assign([("length", length)]).unwrap();
  let input = json!({ "text": "hello", "length": 0 });

  let expected = json!({ "text": "hello", "length": 5 });
  assert_eq!(enrich.invoke(input.clone(), &RunContext::new()).unwrap(), expected);
  assert_eq!(enrich.ainvoke(input, &RunContext::new()).await.unwrap(), expected);
}

#[test]
fn test_passthrough_assign_requires_object_input() {
  let enrich = passthrough_assign([("copy", passthrough())]).unwrap();
  let err = enrich.invoke(json!(3), &RunContext::new()).unwrap_err();
  assert!(err.to_string().contains("expects an object input"));
}

#[test]
fn test_bind_exposes_params() {
  let mut params = Map::new();
  params.insert("greeting".to_string(), json!("hi"));
  let bound = greet().bind(params);

  assert_eq!(bound.kind(), NodeKind::Bound);
  assert_eq!(bound.invoke(json!("ada"), &RunContext::new()).unwrap(), json!("hi, ada"));
  assert_eq!(greet().invoke(json!("ada"), &RunContext::new()).unwrap(), json!("hello, ada"));
}

#[test]
fn test_inner_binding_wins() {
  let mut outer = Map::new();
  outer.insert("greeting".to_string(), json!("outer"));
  let mut inner = Map::new();
  inner.insert("greeting".to_string(), json!("inner"));
  let node = greet().bind(inner).bind(outer);
  assert_eq!(node.invoke(json!("x"), &RunContext::new()).unwrap(), json!("inner, x"));
}

#[test]
fn test_with_config_names_and_tags() {
  let recorder = Arc::new(EventRecorder::new());
  let ctx = RunContext::new().with_listener(recorder.clone());
  let node = greet().with_config(RunConfig::new().with_run_name("salutation").with_tag("ui"));
  node.invoke(json!("x"), &ctx).unwrap();

  let outer = recorder.events_for("salutation");
  assert_eq!(outer.len(), 2);
  assert!(outer[0].tags.is_empty());
  let inner = recorder.events_for("greet");
  assert_eq!(inner.len(), 2);
  assert_eq!(inner[0].tags, vec!["ui".to_string()]);
  assert_eq!(inner[0].parent_run_id, Some(outer[0].run_id));
}

#[tokio::test]
async fn test_bound_streaming_delegates() {
  let words = Node::new(StreamingLambda::with_context("words", |_: Value, ctx: RunContext| {
    let n = ctx.param("n").and_then(Value::as_u64).unwrap_or(0);
    stream::iter((0..n).map(|i| Ok::<_, RunError>(json!([i]))))
  }));
  let mut params = Map::new();
  params.insert("n".to_string(), json!(3));
  let chunks: Vec<Value> = words
    .bind(params)
    .astream(json!(null), &RunContext::new())
    .map(|chunk| chunk.unwrap())
    .collect()
    .await;
  assert_eq!(chunks, vec![json!([0]), json!([1]), json!([2])]);
}
