//! # Retry and Fallback
//!
//! [`Retrying`] re-runs a node under a [`RetryPolicy`] and, once attempts are
//! exhausted, optionally hands the original input to a fallback node.
//!
//! Per invocation the wrapper starts at attempt 1. On failure it retries when
//! attempts remain and the policy's predicate accepts the error, waiting per the
//! [`Backoff`] schedule first. Every attempt is a fresh run of the inner node
//! (new run identifier, parented to the retrying run). On exhaustion the
//! fallback, if any, is invoked exactly once and its outcome propagates as is.
//!
//! Engine errors (recursion limit, cancellation) are never retried and never
//! trigger the fallback, whatever the predicate says.
//!
//! Streaming invocations restart the inner stream from the beginning on every
//! attempt; chunks already yielded by a failed attempt are not retracted.
//!
//! ## Example
//!
//! ```rust
//! use runweave::context::RunContext;
//! use runweave::node::Node;
//! use runweave::nodes::Lambda;
//! use runweave::retry::{Backoff, RetryPolicy};
//! use serde_json::{Value, json};
//!
//! let flaky = Node::new(Lambda::new("flaky", |_: Value| Err::<Value, _>("unavailable")));
//! let cached = Node::new(Lambda::new("cached", |_: Value| Ok::<_, std::io::Error>(json!("cached"))));
//! let resilient = flaky.with_retry_and_fallback(
//!   RetryPolicy::new(3).with_backoff(Backoff::None),
//!   cached,
//! );
//! assert_eq!(resilient.invoke(json!(null), &RunContext::new()).unwrap(), json!("cached"));
//! ```

use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::execution::block_on;
use crate::node::{Capabilities, ChunkStream, Node, NodeKind, Runnable};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Wait schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
  /// Retry immediately.
  None,
  /// Wait the same duration before every retry.
  Fixed(Duration),
  /// Wait `initial * multiplier^(n-1)` before retry `n`, capped at `max`.
  Exponential {
    /// Delay before the first retry.
    initial: Duration,
    /// Growth factor per retry.
    multiplier: f64,
    /// Upper bound on any single delay.
    max: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    jitter: bool,
  },
}

impl Default for Backoff {
  fn default() -> Self {
    Backoff::Exponential {
      initial: Duration::from_millis(100),
      multiplier: 2.0,
      max: Duration::from_secs(10),
      jitter: true,
    }
  }
}

impl Backoff {
  /// Delay to wait after failed attempt `attempt` (1-based).
  pub fn delay(&self, attempt: usize) -> Duration {
    match self {
      Backoff::None => Duration::ZERO,
      Backoff::Fixed(delay) => *delay,
      Backoff::Exponential {
        initial,
        multiplier,
        max,
        jitter,
      } => {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = (initial.as_secs_f64() * multiplier.powi(exponent)).min(max.as_secs_f64());
        let secs = if *jitter {
          secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
          secs
        };
        Duration::try_from_secs_f64(secs).unwrap_or(*max)
      }
    }
  }
}

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&RunError) -> bool + Send + Sync>;

/// How many times to try, how long to wait, and which failures to retry.
#[derive(Clone)]
pub struct RetryPolicy {
  max_attempts: usize,
  backoff: Backoff,
  retry_if: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_attempts", &self.max_attempts)
      .field("backoff", &self.backoff)
      .field("retry_if", &self.retry_if.as_ref().map(|_| "<predicate>"))
      .finish()
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3)
  }
}

impl RetryPolicy {
  /// Allows up to `max_attempts` attempts in total (at least one).
  pub fn new(max_attempts: usize) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      backoff: Backoff::default(),
      retry_if: None,
    }
  }

  /// Sets the wait schedule.
  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  /// Restricts retries to failures accepted by `predicate`.
  pub fn retry_if<F>(mut self, predicate: F) -> Self
  where
    F: Fn(&RunError) -> bool + Send + Sync + 'static,
  {
    self.retry_if = Some(Arc::new(predicate));
    self
  }

  /// Total attempts allowed.
  pub fn max_attempts(&self) -> usize {
    self.max_attempts
  }

  /// The wait schedule.
  pub fn backoff(&self) -> &Backoff {
    &self.backoff
  }

  /// True when failed attempt `attempt` (1-based) should be followed by another.
  pub fn should_retry(&self, attempt: usize, err: &RunError) -> bool {
    if attempt >= self.max_attempts || err.is_engine_error() {
      return false;
    }
    match &self.retry_if {
      Some(predicate) => predicate(err),
      None => true,
    }
  }
}

/// A node run under a retry policy, with an optional fallback.
pub struct Retrying {
  name: String,
  inner: Node,
  policy: RetryPolicy,
  fallback: Option<Node>,
}

impl Retrying {
  /// Wraps `inner`.
  pub fn new(inner: Node, policy: RetryPolicy, fallback: Option<Node>) -> Self {
    let suffix = if fallback.is_some() {
      "with_fallback"
    } else {
      "with_retry"
    };
    Self {
      name: format!("{}.{}", inner.name(), suffix),
      inner,
      policy,
      fallback,
    }
  }

  /// The retry policy.
  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  fn log_retry(&self, attempt: usize, delay: Duration, err: &RunError) {
    warn!(
      node = %self.inner.name(),
      attempt,
      max_attempts = self.policy.max_attempts,
      delay_ms = delay.as_millis() as u64,
      error = %err,
      "attempt failed, retrying"
    );
  }

  fn fallback_for(&self, err: &RunError) -> Option<&Node> {
    if err.is_engine_error() {
      return None;
    }
    let fallback = self.fallback.as_ref()?;
    warn!(
      node = %self.inner.name(),
      fallback = %fallback.name(),
      error = %err,
      "retries exhausted, invoking fallback"
    );
    Some(fallback)
  }

  fn backoff_blocking(&self, delay: Duration, ctx: &RunContext) -> RunResult<()> {
    if delay.is_zero() {
      return Ok(());
    }
    block_on(self.backoff_wait(delay, ctx))?
  }

  async fn backoff_wait(&self, delay: Duration, ctx: &RunContext) -> RunResult<()> {
    if delay.is_zero() {
      return Ok(());
    }
    tokio::select! {
      _ = tokio::time::sleep(delay) => Ok(()),
      _ = ctx.cancelled() => Err(RunError::Cancelled { node: self.name.clone() }),
    }
  }
}

#[async_trait]
impl Runnable for Retrying {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Retrying
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::STREAMING
  }

  fn invoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let mut attempt = 1;
    let err = loop {
      match self.inner.invoke(input.clone(), ctx) {
        Ok(output) => return Ok(output),
        Err(err) if self.policy.should_retry(attempt, &err) => {
          let delay = self.policy.backoff.delay(attempt);
          self.log_retry(attempt, delay, &err);
          self.backoff_blocking(delay, ctx)?;
          attempt += 1;
        }
        Err(err) => break err,
      }
    };
    match self.fallback_for(&err) {
      Some(fallback) => fallback.invoke(input, ctx),
      None => Err(err),
    }
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    let mut attempt = 1;
    let err = loop {
      match self.inner.ainvoke(input.clone(), ctx).await {
        Ok(output) => return Ok(output),
        Err(err) if self.policy.should_retry(attempt, &err) => {
          let delay = self.policy.backoff.delay(attempt);
          self.log_retry(attempt, delay, &err);
          self.backoff_wait(delay, ctx).await?;
          attempt += 1;
        }
        Err(err) => break err,
      }
    };
    match self.fallback_for(&err) {
      Some(fallback) => fallback.ainvoke(input, ctx).await,
      None => Err(err),
    }
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    Box::pin(try_stream! {
      let mut attempt = 1;
      let failure = loop {
        let mut chunks = self.inner.astream(input.clone(), &ctx);
        let mut failed = None;
        while let Some(item) = chunks.next().await {
          match item {
            Ok(chunk) => yield chunk,
            Err(err) => {
              failed = Some(err);
              break;
            }
          }
        }
        match failed {
          None => break None,
          Some(err) if self.policy.should_retry(attempt, &err) => {
            let delay = self.policy.backoff.delay(attempt);
            self.log_retry(attempt, delay, &err);
            self.backoff_wait(delay, &ctx).await?;
            attempt += 1;
          }
          Some(err) => break Some(err),
        }
      };
      if let Some(err) = failure {
        match self.fallback_for(&err) {
          Some(fallback) => {
            let mut chunks = fallback.astream(input, &ctx);
            while let Some(chunk) = chunks.next().await {
              yield chunk?;
            }
          }
          None => Err::<(), RunError>(err)?,
        }
      }
    })
  }
}
