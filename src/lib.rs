//! # RunWeave
//!
//! Composable runnable nodes with one execution engine behind four calling
//! conventions, in pure Rust.
//!
//! A [`Node`] wraps a unit of computation (a prompt formatter, a model call, a
//! parser, a retriever lookup). Nodes compose into immutable trees with
//! [`Node::pipe`] / [`sequence`] and [`parallel`], and every node, leaf or
//! composite, can be called the same ways:
//!
//! - `invoke` / `ainvoke`: one input, one output.
//! - `batch` / `abatch`: many independent inputs, positionally aligned results.
//! - `stream` / `astream`: one input, output chunks as they are produced.
//! - `atransform`: a stream of input chunks in, a stream of output chunks out.
//!
//! ## Key Features
//!
//! - **Write once, call four ways**: a leaf that only supplies a synchronous
//!   `invoke` works in async, batched and streaming calls.
//! - **Observable**: every run emits `start`, `chunk` and exactly one terminal
//!   event to the listeners of its [`RunContext`].
//! - **Bounded**: a shared concurrency budget, a recursion guard and cooperative
//!   cancellation (with timeouts) govern every call tree.
//! - **Resilient**: retry policies with backoff and fallbacks wrap any node.
//! - **Fused streaming**: sequences forward chunks into steps that consume input
//!   incrementally, and buffer at boundaries that cannot.
//!
//! ## Quick Start
//!
//! ```rust
//! use runweave::{Node, RunContext, parallel};
//! use runweave::nodes::{Lambda, passthrough};
//! use serde_json::{Value, json};
//!
//! let add_one = Node::new(Lambda::new("add_one", |v: Value| {
//!   Ok::<_, std::io::Error>(json!(v.as_i64().unwrap_or(0) + 1))
//! }));
//! let double = Node::new(Lambda::new("double", |v: Value| {
//!   Ok::<_, std::io::Error>(json!(v.as_i64().unwrap_or(0) * 2))
//! }));
//!
//! let pipeline = add_one.pipe(parallel([("kept", passthrough()), ("doubled", double)]).unwrap());
//! let out = pipeline.invoke(json!(3), &RunContext::new()).unwrap();
//! assert_eq!(out, json!({ "kept": 4, "doubled": 8 }));
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Batching scheduler: `batch`, `abatch` and `abatch_as_completed`.
pub mod batch;
/// Plain-data run configuration.
pub mod config;
/// Execution context: listeners, annotations, budget, depth guard, cancellation.
pub mod context;
/// Error taxonomy.
pub mod error;
/// Event bus, listeners and invocation records.
pub mod events;
/// Execution engine: the calling forms of a node.
pub mod execution;
/// Sequence and parallel composition.
pub mod graph;
/// The node interface and composition operators.
pub mod node;
/// Built-in leaf adapters and decorators.
pub mod nodes;
/// Retry policies and the fallback wrapper.
pub mod retry;
/// Chunk accumulation, sequence fusion and blocking stream iteration.
pub mod streaming;

pub use batch::{BatchOptions, into_values};
pub use config::RunConfig;
pub use context::RunContext;
pub use error::{RunError, RunResult};
pub use events::{EventRecorder, Listener, Phase, RunEvent, TracingListener};
pub use node::{Capabilities, ChunkStream, Node, NodeKind, Runnable, parallel, sequence};
pub use retry::{Backoff, RetryPolicy};

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod execution_test;
