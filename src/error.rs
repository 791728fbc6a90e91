//! # Error Handling
//!
//! Every calling form of a [`Node`](crate::node::Node) reports failure through a
//! single error type, [`RunError`]. The taxonomy mirrors where in a run a
//! failure can originate:
//!
//! - **Leaf**: the wrapped behavior failed. The engine treats the source error as
//!   opaque and passes it through.
//! - **Step / Branch**: a child of a sequence or parallel node failed. The child's
//!   error is kept as the source, annotated with its position or branch name.
//! - **RecursionLimit**: the depth guard tripped. Always fatal, never retried.
//! - **Cancelled**: a run observed the cancellation signal at a node-entry boundary.
//! - **BatchPartialFailure**: the positionally aligned results of a batch in which
//!   at least one item failed.
//!
//! `RecursionLimit` and `Cancelled` are engine errors: compositions propagate them
//! unwrapped and retry policies never retry them.
//!
//! ## Example
//!
//! ```rust
//! use runweave::error::RunError;
//!
//! let leaf = RunError::leaf("upstream timed out");
//! let err = leaf.at_step(2, "parser");
//! assert_eq!(err.failed_step(), Some(2));
//! assert!(matches!(err.root_cause(), RunError::Leaf(_)));
//! ```

use serde_json::Value;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed, thread-safe error produced by leaf behavior.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result alias used throughout the engine.
pub type RunResult<T> = Result<T, RunError>;

/// Error raised by any node invocation.
#[derive(Error, Debug)]
pub enum RunError {
  /// The wrapped leaf behavior failed.
  #[error(transparent)]
  Leaf(BoxError),

  /// A step of a sequence failed; subsequent steps were not invoked.
  #[error("step {position} ({node}) failed: {source}")]
  Step {
    /// Zero-based position of the failing step.
    position: usize,
    /// Name of the failing step.
    node: String,
    /// The step's own error.
    source: Box<RunError>,
  },

  /// A branch of a parallel node failed.
  #[error("branch '{branch}' failed: {source}")]
  Branch {
    /// Name of the failing branch.
    branch: String,
    /// The branch's own error.
    source: Box<RunError>,
  },

  /// Entering a node would exceed the context's recursion ceiling.
  #[error("recursion limit of {limit} exceeded entering '{node}'")]
  RecursionLimit {
    /// The configured ceiling.
    limit: usize,
    /// Node whose entry tripped the guard.
    node: String,
  },

  /// The cancellation signal was set before the node was entered.
  #[error("run cancelled before entering '{node}'")]
  Cancelled {
    /// Node that observed the signal.
    node: String,
  },

  /// A batch finished with at least one failed item.
  #[error("{failed} of {total} batch items failed")]
  BatchPartialFailure {
    /// Number of failed items.
    failed: usize,
    /// Number of items in the batch.
    total: usize,
    /// Per-item results, aligned with the batch inputs.
    results: Vec<RunResult<Value>>,
  },

  /// A composition was built from invalid operands.
  #[error("invalid composition: {0}")]
  InvalidComposition(String),

  /// A worker hand-off failed (join error or a panic inside a worker).
  #[error("worker failed: {0}")]
  Worker(String),

  /// A private runtime could not be started to drive async work from a blocking caller.
  #[error("failed to start runtime: {0}")]
  Runtime(#[from] std::io::Error),
}

impl RunError {
  /// Wraps arbitrary leaf failure into a [`RunError::Leaf`].
  ///
  /// A boxed [`RunError`] (for example one propagated by a leaf that calls
  /// other nodes) is unboxed rather than wrapped again.
  pub fn leaf(err: impl Into<BoxError>) -> Self {
    match err.into().downcast::<RunError>() {
      Ok(run) => *run,
      Err(other) => RunError::Leaf(other),
    }
  }

  /// Annotates this error with the sequence position it came from.
  ///
  /// Engine errors are returned unchanged.
  pub fn at_step(self, position: usize, node: impl Into<String>) -> Self {
    if self.is_engine_error() {
      return self;
    }
    RunError::Step {
      position,
      node: node.into(),
      source: Box::new(self),
    }
  }

  /// Annotates this error with the parallel branch it came from.
  ///
  /// Engine errors are returned unchanged.
  pub fn in_branch(self, branch: impl Into<String>) -> Self {
    if self.is_engine_error() {
      return self;
    }
    RunError::Branch {
      branch: branch.into(),
      source: Box::new(self),
    }
  }

  /// Follows `Step` and `Branch` wrappers down to the originating error.
  pub fn root_cause(&self) -> &RunError {
    let mut current = self;
    loop {
      match current {
        RunError::Step { source, .. } | RunError::Branch { source, .. } => current = source,
        other => return other,
      }
    }
  }

  /// True for errors produced by the engine itself rather than by node behavior.
  pub fn is_engine_error(&self) -> bool {
    matches!(
      self.root_cause(),
      RunError::Cancelled { .. } | RunError::RecursionLimit { .. }
    )
  }

  /// True when the run stopped because the cancellation signal was observed.
  pub fn is_cancelled(&self) -> bool {
    matches!(self.root_cause(), RunError::Cancelled { .. })
  }

  /// True when the recursion ceiling was exceeded.
  pub fn is_recursion_limit(&self) -> bool {
    matches!(self.root_cause(), RunError::RecursionLimit { .. })
  }

  /// Position of the outermost failing sequence step, if any.
  pub fn failed_step(&self) -> Option<usize> {
    match self {
      RunError::Step { position, .. } => Some(*position),
      _ => None,
    }
  }

  /// Name of the outermost failing parallel branch, if any.
  pub fn failed_branch(&self) -> Option<&str> {
    match self {
      RunError::Branch { branch, .. } => Some(branch),
      _ => None,
    }
  }
}
