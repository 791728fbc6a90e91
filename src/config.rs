//! Run configuration.
//!
//! [`RunConfig`] is plain structured data: it can be built fluently, loaded from
//! any serde format, or attached to a node with
//! [`Node::with_config`](crate::node::Node::with_config). A
//! [`RunContext`](crate::context::RunContext) is created from it for each
//! top-level call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default recursion ceiling: maximum number of nested node entries per call.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Multiplier applied to the detected parallelism for the default concurrency budget.
pub const CONCURRENCY_PER_CORE: usize = 4;

/// Default concurrency budget: a small multiple of the detected parallelism.
pub fn default_max_concurrency() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
    * CONCURRENCY_PER_CORE
}

/// Configuration recognized when creating an execution context or binding a node.
///
/// Every field is optional; unset fields fall back to the engine defaults
/// (or, when used as an overlay, to the enclosing context's values).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
  /// Name reported for the first run entered with this configuration.
  pub run_name: Option<String>,
  /// Tags attached to every event of the run and its descendants.
  pub tags: BTreeSet<String>,
  /// Metadata attached to every event of the run and its descendants.
  pub metadata: Map<String, Value>,
  /// Concurrency budget (top level) or default batch cap (overlay).
  pub max_concurrency: Option<usize>,
  /// Ceiling on nested node entries.
  pub recursion_limit: Option<usize>,
  /// Derived cancellation: the run is cancelled once this many milliseconds elapse.
  pub timeout_ms: Option<u64>,
}

impl RunConfig {
  /// Creates an empty configuration.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the run name.
  pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
    self.run_name = Some(name.into());
    self
  }

  /// Adds a tag.
  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  /// Adds a metadata entry.
  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  /// Sets the concurrency limit.
  pub fn with_max_concurrency(mut self, limit: usize) -> Self {
    self.max_concurrency = Some(limit);
    self
  }

  /// Sets the recursion ceiling.
  pub fn with_recursion_limit(mut self, limit: usize) -> Self {
    self.recursion_limit = Some(limit);
    self
  }

  /// Sets the timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = Some(timeout.as_millis() as u64);
    self
  }

  /// Returns the timeout as a [`Duration`], if set.
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }

  /// Layers `overlay` on top of `self`.
  ///
  /// Tags are unioned, metadata keys from the overlay win, and scalar fields
  /// take the overlay's value when it is set.
  pub fn merge(&self, overlay: &RunConfig) -> RunConfig {
    let mut merged = self.clone();
    merged.tags.extend(overlay.tags.iter().cloned());
    for (key, value) in &overlay.metadata {
      merged.metadata.insert(key.clone(), value.clone());
    }
    if overlay.run_name.is_some() {
      merged.run_name = overlay.run_name.clone();
    }
    if overlay.max_concurrency.is_some() {
      merged.max_concurrency = overlay.max_concurrency;
    }
    if overlay.recursion_limit.is_some() {
      merged.recursion_limit = overlay.recursion_limit;
    }
    if overlay.timeout_ms.is_some() {
      merged.timeout_ms = overlay.timeout_ms;
    }
    merged
  }
}
