//! # Execution Engine Test Suite
//!
//! Every calling form on minimal leaves, the worker hand-off for synchronous
//! leaves called asynchronously, the concurrency budget, the recursion guard
//! and cooperative cancellation.

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::RunError;
use crate::events::{EventRecorder, Phase};
use crate::execution::block_on;
use crate::node::{ChunkStream, Node, parallel, sequence};
use crate::nodes::{AsyncLambda, Generator, Lambda, passthrough};
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn inc() -> Node {
  Node::new(Lambda::new("inc", |v: Value| {
    Ok::<_, RunError>(json!(v.as_i64().unwrap_or(0) + 1))
  }))
}

fn async_inc() -> Node {
  Node::new(AsyncLambda::new("async_inc", |v: Value| async move {
    tokio::task::yield_now().await;
    Ok::<_, RunError>(json!(v.as_i64().unwrap_or(0) + 1))
  }))
}

#[test]
fn test_sync_leaf_invoke() {
  assert_eq!(inc().invoke(json!(41), &RunContext::new()).unwrap(), json!(42));
}

#[tokio::test]
async fn test_sync_leaf_ainvoke_runs_on_worker() {
  let caller = std::thread::current().id();
  let node = Node::new(Lambda::new("where", move |_: Value| {
    Ok::<_, RunError>(json!(std::thread::current().id() != caller))
  }));
  assert_eq!(node.ainvoke(json!(null), &RunContext::new()).await.unwrap(), json!(true));
}

#[tokio::test]
async fn test_sync_leaf_astream_yields_single_chunk() {
  let chunks: Vec<Value> = inc()
    .astream(json!(1), &RunContext::new())
    .map(|chunk| chunk.unwrap())
    .collect()
    .await;
  assert_eq!(chunks, vec![json!(2)]);
}

#[test]
fn test_async_leaf_invoke_without_runtime() {
  assert_eq!(async_inc().invoke(json!(1), &RunContext::new()).unwrap(), json!(2));
}

#[tokio::test]
async fn test_async_leaf_invoke_inside_current_thread_runtime() {
  assert_eq!(async_inc().invoke(json!(1), &RunContext::new()).unwrap(), json!(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_leaf_invoke_inside_multi_thread_runtime() {
  assert_eq!(async_inc().invoke(json!(1), &RunContext::new()).unwrap(), json!(2));
}

#[tokio::test]
async fn test_async_leaf_ainvoke() {
  assert_eq!(async_inc().ainvoke(json!(5), &RunContext::new()).await.unwrap(), json!(6));
}

#[test]
fn test_block_on_outside_runtime() {
  assert_eq!(block_on(async { 7 }).unwrap(), 7);
}

#[test]
fn test_leaf_permit_is_released() {
  let ctx = RunContext::from_config(&RunConfig::new().with_max_concurrency(1));
  for n in 0..3 {
    assert_eq!(inc().invoke(json!(n), &ctx).unwrap(), json!(n + 1));
  }
  assert_eq!(ctx.budget().available(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_budget_bounds_fused_generators() {
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let (r, p) = (running.clone(), peak.clone());
  let slow_echo = Node::new(Generator::new("slow_echo", move |input: ChunkStream| {
    let (running, peak) = (r.clone(), p.clone());
    input.then(move |chunk| {
      let (running, peak) = (running.clone(), peak.clone());
      async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        chunk
      }
    })
  }));
  let fan_out = parallel([
    ("a", passthrough().pipe(slow_echo.clone())),
    ("b", passthrough().pipe(slow_echo)),
  ])
  .unwrap();
  let ctx = RunContext::from_config(&RunConfig::new().with_max_concurrency(1));

  let chunks: Vec<_> = fan_out.astream(json!(7), &ctx).collect().await;
  assert_eq!(chunks.len(), 2);
  assert!(chunks.iter().all(Result::is_ok));
  assert_eq!(peak.load(Ordering::SeqCst), 1);
  assert_eq!(ctx.budget().available(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_budget_bounds_concurrent_leaves() {
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let (r, p) = (running.clone(), peak.clone());
  let slow = Node::new(AsyncLambda::new("slow", move |v: Value| {
    let (running, peak) = (r.clone(), p.clone());
    async move {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      running.fetch_sub(1, Ordering::SeqCst);
      Ok::<_, RunError>(v)
    }
  }));
  let ctx = RunContext::from_config(&RunConfig::new().with_max_concurrency(2));
  let calls = (0..8).map(|n| slow.ainvoke(json!(n), &ctx));
  let results = futures::future::join_all(calls).await;

  assert!(results.iter().all(Result::is_ok));
  assert!(peak.load(Ordering::SeqCst) <= 2);
  assert_eq!(ctx.budget().available(), 2);
}

#[test]
fn test_recursion_guard_fails_instead_of_overflowing() {
  let mut node = inc();
  for _ in 0..30 {
    node = node.pipe(inc());
  }
  let err = node.invoke(json!(0), &RunContext::new()).unwrap_err();
  assert!(err.is_recursion_limit());
  assert!(matches!(err, RunError::RecursionLimit { limit: 25, .. }));
}

#[test]
fn test_recursion_limit_is_configurable() {
  let pipeline = sequence([inc(), inc()]).unwrap();
  let shallow = RunContext::from_config(&RunConfig::new().with_recursion_limit(1));
  assert!(pipeline.invoke(json!(0), &shallow).unwrap_err().is_recursion_limit());
  let enough = RunContext::from_config(&RunConfig::new().with_recursion_limit(2));
  assert_eq!(pipeline.invoke(json!(0), &enough).unwrap(), json!(2));
}

#[test]
fn test_cancellation_observed_at_next_entry() {
  let recorder = Arc::new(EventRecorder::new());
  let ctx = RunContext::new().with_listener(recorder.clone());
  let stopper = ctx.clone();
  let cancel_here = Node::new(Lambda::new("cancel_here", move |v: Value| {
    stopper.cancel();
    Ok::<_, RunError>(v)
  }));
  let pipeline = sequence([cancel_here, inc()]).unwrap();

  let err = pipeline.invoke(json!(1), &ctx).unwrap_err();
  assert!(err.is_cancelled());
  assert_eq!(recorder.count("cancel_here", Phase::End), 1);
  assert_eq!(recorder.count("inc", Phase::Cancelled), 1);
}

#[tokio::test]
async fn test_timeout_cancels_following_steps() {
  let slow = Node::new(AsyncLambda::new("slow", |v: Value| async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok::<_, RunError>(v)
  }));
  let pipeline = sequence([slow, inc()]).unwrap();
  let ctx = RunContext::from_config(&RunConfig::new().with_timeout(Duration::from_millis(10)));

  let err = pipeline.ainvoke(json!(1), &ctx).await.unwrap_err();
  assert!(err.is_cancelled());
}

#[test]
fn test_run_name_applies_to_first_run_only() {
  let recorder = Arc::new(EventRecorder::new());
  let ctx = RunContext::from_config(&RunConfig::new().with_run_name("pipeline"))
    .with_listener(recorder.clone());
  sequence([inc(), inc()]).unwrap().invoke(json!(0), &ctx).unwrap();
  assert_eq!(recorder.count("pipeline", Phase::Start), 1);
  assert_eq!(recorder.count("inc", Phase::Start), 2);
}

#[tokio::test]
async fn test_leaf_panic_on_worker_is_reported() {
  let node = Node::new(Lambda::new("panics", |_: Value| -> Result<Value, RunError> {
    panic!("leaf bug")
  }));
  let err = node.ainvoke(json!(null), &RunContext::new()).await.unwrap_err();
  assert!(matches!(err, RunError::Worker(_)));
}
