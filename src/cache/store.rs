//! Bounded, TTL-aware in-memory cache store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, SetOptions};
use crate::config::StoreConfig;

/// Snapshot of a store's aggregate statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  pub hit_rate: f64,
  pub total_requests: u64,
  pub total_hits: u64,
  pub total_misses: u64,
  pub total_size: usize,
  pub entry_count: usize,
  pub gc_runs: u64,
  pub last_gc: Option<DateTime<Utc>>,
  pub evictions: u64,
}

#[derive(Debug)]
struct StoreState {
  config: StoreConfig,
  entries: HashMap<String, CacheEntry>,
  total_size: usize,
  total_requests: u64,
  hits: u64,
  misses: u64,
  gc_runs: u64,
  last_gc: Option<DateTime<Utc>>,
  evictions: u64,
}

impl StoreState {
  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    self.total_size -= entry.size;
    Some(entry)
  }

  fn insert(&mut self, key: String, entry: CacheEntry) {
    self.total_size += entry.size;
    self.entries.insert(key, entry);
  }

  fn over_budget(&self, incoming: usize) -> bool {
    self.total_size + incoming > self.config.max_size_bytes
      || self.entries.len() >= self.config.max_entries
  }

  /// Evict entries until `incoming` bytes and one more slot fit.
  fn evict_for(&mut self, incoming: usize) {
    let mut victims: Vec<(String, &CacheEntry)> = self
      .entries
      .iter()
      .map(|(k, e)| (k.clone(), e))
      .collect();
    victims.sort_by(|(_, a), (_, b)| eviction_order(a, b));
    let victims: Vec<String> = victims.into_iter().map(|(k, _)| k).collect();

    for key in victims {
      if !self.over_budget(incoming) {
        break;
      }
      if let Some(entry) = self.remove(&key) {
        self.evictions += 1;
        debug!(key = %key, priority = ?entry.priority, size = entry.size, "evicted cache entry");
      }
    }
  }

  fn sweep(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    self.gc_runs += 1;
    self.last_gc = Some(Utc::now());
    expired.len()
  }
}

/// Eviction ordering: lowest priority first, then least recently used,
/// then least frequently used.
fn eviction_order(a: &CacheEntry, b: &CacheEntry) -> Ordering {
  a.priority
    .cmp(&b.priority)
    .then(a.last_access.cmp(&b.last_access))
    .then(a.access_count.cmp(&b.access_count))
}

/// A bounded key/value store with TTL expiry and priority-aware eviction.
///
/// Cloning yields another handle to the same store. Memory pressure is
/// always resolved by eviction; writes never fail.
#[derive(Clone)]
pub struct CacheStore {
  name: Arc<str>,
  state: Arc<Mutex<StoreState>>,
  gc_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CacheStore {
  pub fn new(name: impl Into<Arc<str>>, config: StoreConfig) -> Self {
    Self {
      name: name.into(),
      state: Arc::new(Mutex::new(StoreState {
        config,
        entries: HashMap::new(),
        total_size: 0,
        total_requests: 0,
        hits: 0,
        misses: 0,
        gc_runs: 0,
        last_gc: None,
        evictions: 0,
      })),
      gc_task: Arc::new(Mutex::new(None)),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    // The state holds no invariants that a panicking reader could break.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Insert or replace `key`, evicting other entries first if needed.
  pub fn set(&self, key: &str, value: Value, options: SetOptions) {
    let mut state = self.lock();
    let ttl = options.ttl.unwrap_or(state.config.default_ttl());
    let entry = CacheEntry::new(key, value, ttl, options);

    state.remove(key);
    if state.over_budget(entry.size) {
      state.evict_for(entry.size);
    }
    debug!(store = %self.name, key, size = entry.size, "cache set");
    state.insert(key.to_string(), entry);
  }

  /// Read `key`, counting a hit or a miss. Expired entries are dropped.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.get_with_age(key).map(|(value, _)| value)
  }

  /// Read `key` together with the age of the entry.
  pub fn get_with_age(&self, key: &str) -> Option<(Value, Duration)> {
    let now = Instant::now();
    let mut state = self.lock();
    state.total_requests += 1;

    let expired = match state.entries.get(key) {
      None => {
        state.misses += 1;
        return None;
      }
      Some(entry) => entry.is_expired(now),
    };

    if expired {
      state.remove(key);
      state.misses += 1;
      debug!(store = %self.name, key, "cache entry expired on read");
      return None;
    }

    state.hits += 1;
    let entry = state.entries.get_mut(key)?;
    entry.touch(now);
    Some((entry.value.clone(), entry.age(now)))
  }

  /// Existence check honoring expiry. Does not touch access statistics.
  pub fn has(&self, key: &str) -> bool {
    let now = Instant::now();
    self
      .lock()
      .entries
      .get(key)
      .map(|e| !e.is_expired(now))
      .unwrap_or(false)
  }

  pub fn delete(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  /// Remove every entry and reset all statistics.
  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.total_size = 0;
    state.total_requests = 0;
    state.hits = 0;
    state.misses = 0;
    state.gc_runs = 0;
    state.last_gc = None;
    state.evictions = 0;
  }

  /// Remove every entry carrying at least one of `tags`.
  pub fn clear_by_tags(&self, tags: &BTreeSet<String>) -> usize {
    let mut state = self.lock();
    let matching: Vec<String> = state
      .entries
      .iter()
      .filter(|(_, e)| e.has_any_tag(tags))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &matching {
      state.remove(key);
    }
    matching.len()
  }

  /// Live (unexpired) keys.
  pub fn keys(&self) -> Vec<String> {
    let now = Instant::now();
    self
      .lock()
      .entries
      .iter()
      .filter(|(_, e)| !e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect()
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.lock();
    let hit_rate = if state.total_requests == 0 {
      0.0
    } else {
      state.hits as f64 / state.total_requests as f64
    };
    CacheStats {
      hit_rate,
      total_requests: state.total_requests,
      total_hits: state.hits,
      total_misses: state.misses,
      total_size: state.total_size,
      entry_count: state.entries.len(),
      gc_runs: state.gc_runs,
      last_gc: state.last_gc,
      evictions: state.evictions,
    }
  }

  /// Sweep expired entries now. Returns how many were collected.
  pub fn collect_garbage(&self) -> usize {
    let collected = self.lock().sweep(Instant::now());
    if collected > 0 {
      debug!(store = %self.name, collected, "garbage collected expired entries");
    }
    collected
  }

  /// Start the periodic GC sweep. Calling it again restarts the timer.
  pub fn start_gc(&self) {
    let Some(period) = self.lock().config.gc_interval() else {
      return;
    };
    let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
    let name = Arc::clone(&self.name);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      loop {
        ticker.tick().await;
        let Some(state) = weak.upgrade() else {
          break;
        };
        let collected = state
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .sweep(Instant::now());
        if collected > 0 {
          debug!(store = %name, collected, "periodic gc");
        }
      }
    });

    let mut slot = self.gc_task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = slot.replace(handle) {
      previous.abort();
    }
  }

  /// Stop the GC timer.
  pub fn destroy(&self) {
    if let Some(handle) = self
      .gc_task
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take()
    {
      handle.abort();
    }
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("name", &self.name)
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}
