//! # Run Configuration Test Suite

use crate::config::{CONCURRENCY_PER_CORE, DEFAULT_RECURSION_LIMIT, RunConfig, default_max_concurrency};
use serde_json::json;
use std::time::Duration;

#[test]
fn test_defaults() {
  let config = RunConfig::default();
  assert_eq!(config.run_name, None);
  assert!(config.tags.is_empty());
  assert!(config.metadata.is_empty());
  assert_eq!(config.timeout(), None);
  assert_eq!(DEFAULT_RECURSION_LIMIT, 25);
  assert_eq!(default_max_concurrency() % CONCURRENCY_PER_CORE, 0);
  assert!(default_max_concurrency() >= CONCURRENCY_PER_CORE);
}

#[test]
fn test_builder() {
  let config = RunConfig::new()
    .with_run_name("summarize")
    .with_tag("prod")
    .with_metadata("tenant", "acme")
    .with_max_concurrency(8)
    .with_recursion_limit(10)
    .with_timeout(Duration::from_millis(1500));

  assert_eq!(config.run_name.as_deref(), Some("summarize"));
  assert!(config.tags.contains("prod"));
  assert_eq!(config.metadata["tenant"], json!("acme"));
  assert_eq!(config.max_concurrency, Some(8));
  assert_eq!(config.recursion_limit, Some(10));
  assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
}

#[test]
fn test_deserialize_partial() {
  let config: RunConfig = serde_json::from_value(json!({
    "tags": ["batch", "nightly"],
    "recursion_limit": 5
  }))
  .unwrap();
  assert_eq!(config.tags.len(), 2);
  assert_eq!(config.recursion_limit, Some(5));
  assert_eq!(config.max_concurrency, None);
}

#[test]
fn test_serialize_roundtrip_keeps_fields() {
  let config = RunConfig::new().with_tag("a").with_timeout(Duration::from_secs(2));
  let value = serde_json::to_value(&config).unwrap();
  assert_eq!(value["timeout_ms"], json!(2000));
  let back: RunConfig = serde_json::from_value(value).unwrap();
  assert_eq!(back, config);
}

#[test]
fn test_merge_overlay_wins() {
  let base = RunConfig::new()
    .with_tag("base")
    .with_metadata("k", 1)
    .with_recursion_limit(25);
  let overlay = RunConfig::new()
    .with_tag("overlay")
    .with_metadata("k", 2)
    .with_max_concurrency(2);

  let merged = base.merge(&overlay);
  assert!(merged.tags.contains("base"));
  assert!(merged.tags.contains("overlay"));
  assert_eq!(merged.metadata["k"], json!(2));
  assert_eq!(merged.recursion_limit, Some(25));
  assert_eq!(merged.max_concurrency, Some(2));
}
