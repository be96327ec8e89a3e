//! Cache entries and the options used to write them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// Eviction priority. Lower priorities are evicted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
}

/// Options accepted by [`CacheStore::set`](super::CacheStore::set).
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
  /// Overrides the store's default TTL
  pub ttl: Option<Duration>,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
}

impl SetOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags.extend(tags.into_iter().map(Into::into));
    self
  }
}

/// A value held by a cache store together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Value,
  /// When the entry was written
  pub created_at: Instant,
  pub ttl: Duration,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  pub access_count: u64,
  pub last_access: Instant,
  /// Estimated footprint in bytes (serialized value plus key)
  pub size: usize,
}

impl CacheEntry {
  pub(crate) fn new(key: &str, value: Value, ttl: Duration, options: SetOptions) -> Self {
    let now = Instant::now();
    let size = estimate_size(key, &value);
    Self {
      value,
      created_at: now,
      ttl,
      priority: options.priority,
      tags: options.tags,
      access_count: 0,
      last_access: now,
      size,
    }
  }

  /// An entry is expired once strictly more than its TTL has elapsed.
  pub fn is_expired(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.created_at) > self.ttl
  }

  pub fn age(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.created_at)
  }

  pub(crate) fn touch(&mut self, now: Instant) {
    self.access_count += 1;
    self.last_access = now;
  }

  pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
    !self.tags.is_disjoint(tags)
  }
}

/// Estimate the memory footprint of a value stored under `key`.
pub fn estimate_size(key: &str, value: &Value) -> usize {
  let body = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
  key.len() + body
}
