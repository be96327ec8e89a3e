//! Access tracking and warm-candidate scoring.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::inflight::Fetcher;
use super::ReadConfig;

/// How access patterns are turned into warming decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarmingStrategy {
  /// Warm anything accessed at least `threshold` times
  Aggressive,
  /// Like aggressive, but only if accessed within the last interval
  Conservative,
  /// Access count decayed by time since last access
  #[default]
  Smart,
}

impl WarmingStrategy {
  /// Score a pattern, or `None` if it should not be warmed.
  pub fn score(
    self,
    pattern: &AccessPattern,
    threshold: f64,
    interval: Duration,
    now: Instant,
  ) -> Option<f64> {
    let count = pattern.access_count as f64;
    let since = now.saturating_duration_since(pattern.last_access);
    match self {
      WarmingStrategy::Aggressive => (count >= threshold).then_some(count),
      WarmingStrategy::Conservative => (count >= threshold && since <= interval).then_some(count),
      WarmingStrategy::Smart => {
        let interval = interval.as_secs_f64().max(f64::EPSILON);
        let score = count / (1.0 + since.as_secs_f64() / interval);
        (score >= threshold / 2.0).then_some(score)
      }
    }
  }
}

/// Per-key access counter kept by the strategy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPattern {
  pub access_count: u64,
  pub last_access: Instant,
}

/// What is needed to re-run a read out of band.
#[derive(Clone)]
pub(crate) struct WarmTarget {
  pub key: String,
  pub fetcher: Fetcher,
  pub config: ReadConfig,
}

#[derive(Default)]
pub(crate) struct AccessTracker {
  patterns: HashMap<String, AccessPattern>,
  targets: HashMap<String, WarmTarget>,
}

impl AccessTracker {
  pub fn record(&mut self, storage_key: &str, now: Instant, target: Option<WarmTarget>) {
    let pattern = self
      .patterns
      .entry(storage_key.to_string())
      .or_insert(AccessPattern {
        access_count: 0,
        last_access: now,
      });
    pattern.access_count += 1;
    pattern.last_access = now;

    if let Some(target) = target {
      self.targets.insert(storage_key.to_string(), target);
    }
  }

  pub fn pattern(&self, storage_key: &str) -> Option<AccessPattern> {
    self.patterns.get(storage_key).copied()
  }

  /// Highest-scoring warmable keys, at most `limit` of them.
  pub fn candidates(
    &self,
    strategy: WarmingStrategy,
    threshold: f64,
    interval: Duration,
    now: Instant,
    limit: usize,
  ) -> Vec<(String, WarmTarget)> {
    let mut scored: Vec<(f64, &String, &WarmTarget)> = self
      .targets
      .iter()
      .filter_map(|(key, target)| {
        let pattern = self.patterns.get(key)?;
        let score = strategy.score(pattern, threshold, interval, now)?;
        Some((score, key, target))
      })
      .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored
      .into_iter()
      .take(limit)
      .map(|(_, key, target)| (key.clone(), target.clone()))
      .collect()
  }

  pub fn clear(&mut self) {
    self.patterns.clear();
    self.targets.clear();
  }
}
