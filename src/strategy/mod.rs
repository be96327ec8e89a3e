//! Read strategies layered over the cache tiers.
//!
//! The [`StrategyEngine`] decides per read whether to serve cached data,
//! fetch synchronously, or refresh in the background. It also owns the
//! dependency graph used for invalidate-on-write and the access tracker
//! that feeds cache warming.

mod dependencies;
mod engine;
mod inflight;
mod warming;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::cache::{Priority, SetOptions};

pub use dependencies::DependencyGraph;
pub use engine::StrategyEngine;
pub use warming::{AccessPattern, WarmingStrategy};

/// How a read consults the cache and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadStrategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

impl ReadStrategy {
  /// Strategies whose results are worth re-fetching ahead of time.
  fn reads_cache(self) -> bool {
    !matches!(self, ReadStrategy::NetworkOnly | ReadStrategy::CacheOnly)
  }
}

/// Fully resolved configuration for one read or write.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadConfig {
  pub strategy: ReadStrategy,
  /// Entry TTL; the store default applies when unset
  pub ttl: Option<Duration>,
  /// Cached entries older than this are not served by cache-first and are
  /// not revalidated by stale-while-revalidate until they reach it
  pub max_age: Option<Duration>,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  /// Appended to the key as `_v{version}`
  pub version: u32,
  /// Keys whose writes invalidate this one
  pub dependencies: Vec<String>,
  /// Network-only reads write their result back to the cache
  pub sync_online: bool,
}

impl ReadConfig {
  pub fn new(strategy: ReadStrategy) -> Self {
    Self {
      strategy,
      ttl: None,
      max_age: None,
      priority: Priority::default(),
      tags: BTreeSet::new(),
      version: 1,
      dependencies: Vec::new(),
      sync_online: false,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
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

  pub fn with_version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  pub fn with_dependencies<I, S>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.dependencies.extend(keys.into_iter().map(Into::into));
    self
  }

  pub fn with_sync_online(mut self, sync_online: bool) -> Self {
    self.sync_online = sync_online;
    self
  }

  pub(crate) fn set_options(&self) -> SetOptions {
    SetOptions {
      ttl: self.ttl,
      priority: self.priority,
      tags: self.tags.clone(),
    }
  }
}

impl Default for ReadConfig {
  fn default() -> Self {
    Self::new(ReadStrategy::CacheFirst)
  }
}

/// The storage key for `key` under a schema version.
pub fn versioned_key(key: &str, version: u32) -> String {
  format!("{}_v{}", key, version)
}
