//! Strategy engine that orchestrates caching logic with remote fetching.

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dependencies::DependencyGraph;
use super::inflight::{Fetcher, InFlight};
use super::warming::{AccessPattern, AccessTracker, WarmTarget};
use super::{versioned_key, ReadConfig, ReadStrategy};
use crate::cache::{CacheResult, CacheTiers};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

struct EngineInner {
  tiers: CacheTiers,
  config: EngineConfig,
  dependencies: Mutex<DependencyGraph>,
  access: Mutex<AccessTracker>,
  inflight: InFlight,
  warming_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Strategy engine that manages cache reads, writes and warming.
///
/// This sits between the data layer and the remote API, choosing per call
/// between cached and fetched data. Cloning yields another handle to the
/// same engine.
#[derive(Clone)]
pub struct StrategyEngine {
  inner: Arc<EngineInner>,
}

impl StrategyEngine {
  pub fn new(tiers: CacheTiers, config: EngineConfig) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        tiers,
        config,
        dependencies: Mutex::new(DependencyGraph::new()),
        access: Mutex::new(AccessTracker::default()),
        inflight: InFlight::new(),
        warming_task: Mutex::new(None),
      }),
    }
  }

  pub fn tiers(&self) -> &CacheTiers {
    &self.inner.tiers
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  /// Resolve `key` according to `config.strategy`.
  ///
  /// The fetcher may be invoked now, in the background, by a later warming
  /// cycle, or not at all, depending on the strategy.
  pub async fn get<T, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    config: &ReadConfig,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || {
      let request = fetcher();
      async move {
        let data = request.await?;
        Ok(serde_json::to_value(data)?)
      }
      .boxed()
    });

    let storage_key = versioned_key(key, config.version);
    self.track(key, &storage_key, &fetcher, config);

    let result = self.resolve(key, &storage_key, fetcher, config).await?;
    Ok(CacheResult {
      data: serde_json::from_value(result.data)?,
      source: result.source,
    })
  }

  fn track(&self, key: &str, storage_key: &str, fetcher: &Fetcher, config: &ReadConfig) {
    let warmable = config.strategy.reads_cache()
      || (config.strategy == ReadStrategy::NetworkOnly && config.sync_online);
    let target = warmable.then(|| WarmTarget {
      key: key.to_string(),
      fetcher: Arc::clone(fetcher),
      config: config.clone(),
    });
    lock(&self.inner.access).record(storage_key, Instant::now(), target);

    if !config.dependencies.is_empty() {
      let mut graph = lock(&self.inner.dependencies);
      for dependency in &config.dependencies {
        graph.add(dependency, storage_key);
      }
    }
  }

  async fn resolve(
    &self,
    key: &str,
    storage_key: &str,
    fetcher: Fetcher,
    config: &ReadConfig,
  ) -> Result<CacheResult<Value>> {
    let store = self.inner.tiers.route(&config.tags);

    match config.strategy {
      ReadStrategy::CacheFirst => {
        if let Some((value, age)) = store.get_with_age(storage_key) {
          if config.max_age.map_or(true, |max| age <= max) {
            debug!(key = storage_key, "cache-first hit");
            return Ok(CacheResult::from_cache(value, false));
          }
        }
        let value = self.fetch_and_store(key, storage_key, &fetcher, config).await?;
        Ok(CacheResult::from_network(value))
      }

      ReadStrategy::NetworkFirst => match self.fetch_and_store(key, storage_key, &fetcher, config).await {
        Ok(value) => Ok(CacheResult::from_network(value)),
        Err(e) => match store.get(storage_key) {
          Some(cached) => {
            warn!(key = storage_key, error = %e, "network-first fetch failed, serving cached data");
            Ok(CacheResult::offline(cached))
          }
          None => Err(e),
        },
      },

      ReadStrategy::StaleWhileRevalidate => match store.get_with_age(storage_key) {
        Some((cached, age)) => {
          let due = config.max_age.map_or(true, |max| age > max);
          if due {
            self.revalidate(key, storage_key, fetcher, config.clone());
          }
          Ok(CacheResult::from_cache(cached, due))
        }
        None => {
          let value = self.fetch_and_store(key, storage_key, &fetcher, config).await?;
          Ok(CacheResult::from_network(value))
        }
      },

      ReadStrategy::NetworkOnly => {
        let value = self.inner.inflight.fetch(storage_key, &fetcher).await?;
        if config.sync_online {
          self.write(key, storage_key, value.clone(), config);
        }
        Ok(CacheResult::from_network(value))
      }

      ReadStrategy::CacheOnly => store
        .get(storage_key)
        .map(|value| CacheResult::from_cache(value, false))
        .ok_or_else(|| Error::NotCached {
          key: storage_key.to_string(),
        }),
    }
  }

  async fn fetch_and_store(
    &self,
    key: &str,
    storage_key: &str,
    fetcher: &Fetcher,
    config: &ReadConfig,
  ) -> Result<Value> {
    debug!(key = storage_key, strategy = ?config.strategy, "fetching from remote");
    let value = self.inner.inflight.fetch(storage_key, fetcher).await?;
    self.write(key, storage_key, value.clone(), config);
    Ok(value)
  }

  /// Refresh `storage_key` in the background. Failures are logged only.
  fn revalidate(&self, key: &str, storage_key: &str, fetcher: Fetcher, config: ReadConfig) {
    let engine = self.clone();
    let key = key.to_string();
    let storage_key = storage_key.to_string();
    tokio::spawn(async move {
      match engine.inner.inflight.fetch(&storage_key, &fetcher).await {
        Ok(value) => {
          engine.write(&key, &storage_key, value, &config);
          debug!(key = %storage_key, "background refresh stored");
        }
        Err(e) => warn!(key = %storage_key, error = %e, "background refresh failed"),
      }
    });
  }

  /// Write `value` under `key` (versioned per `config`) and invalidate its dependents.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, config: &ReadConfig) -> Result<()> {
    let value = serde_json::to_value(value)?;
    let storage_key = versioned_key(key, config.version);
    self.write(key, &storage_key, value, config);
    Ok(())
  }

  fn write(&self, key: &str, storage_key: &str, value: Value, config: &ReadConfig) {
    self
      .inner
      .tiers
      .route(&config.tags)
      .set(storage_key, value, config.set_options());
    self.cascade(key, storage_key);
  }

  fn cascade(&self, key: &str, written: &str) {
    let dependents = lock(&self.inner.dependencies).take(key);
    for dependent in dependents.iter().filter(|d| d.as_str() != written) {
      if self.inner.tiers.delete_everywhere(dependent) {
        debug!(dependency = key, dependent = %dependent, "invalidated dependent key");
      }
    }
  }

  /// Remove `key` at `version` from every tier and invalidate its dependents.
  pub fn invalidate(&self, key: &str, version: u32) -> bool {
    let storage_key = versioned_key(key, version);
    let removed = self.inner.tiers.delete_everywhere(&storage_key);
    self.cascade(key, &storage_key);
    removed
  }

  pub fn invalidate_tags(&self, tags: &BTreeSet<String>) -> usize {
    self.inner.tiers.clear_by_tags(tags)
  }

  pub fn access_pattern(&self, storage_key: &str) -> Option<AccessPattern> {
    lock(&self.inner.access).pattern(storage_key)
  }

  pub fn dependents_of(&self, key: &str) -> Vec<String> {
    lock(&self.inner.dependencies).dependents(key)
  }

  /// Run one warming cycle: prune dead dependency edges, then refresh the
  /// best-scoring tracked keys in the background. Returns the warmed keys.
  pub fn run_warming_cycle(&self) -> Vec<String> {
    let tiers = &self.inner.tiers;
    let pruned = lock(&self.inner.dependencies).retain(|dependent| tiers.is_resident(dependent));
    if pruned > 0 {
      debug!(pruned, "pruned dependency edges to non-resident keys");
    }

    let config = &self.inner.config;
    let candidates = lock(&self.inner.access).candidates(
      config.warming_strategy,
      config.warming_threshold,
      config.warming_interval(),
      Instant::now(),
      config.max_warming_batch_size,
    );

    let mut warmed = Vec::with_capacity(candidates.len());
    for (storage_key, target) in candidates {
      self.revalidate(&target.key, &storage_key, target.fetcher, target.config);
      warmed.push(storage_key);
    }
    if !warmed.is_empty() {
      debug!(count = warmed.len(), "warming cycle scheduled refreshes");
    }
    warmed
  }

  /// Schedule warming every `warming_interval_ms`. No-op when disabled.
  pub fn start_warming(&self) {
    if !self.inner.config.warming_enabled {
      return;
    }
    let period = self.inner.config.warming_interval();
    let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        StrategyEngine { inner }.run_warming_cycle();
      }
    });

    if let Some(previous) = lock(&self.inner.warming_task).replace(handle) {
      previous.abort();
    }
  }

  /// Start warming and every tier's GC timer.
  pub fn start(&self) {
    self.inner.tiers.start_gc();
    self.start_warming();
  }

  /// Stop all timers and forget tracked access patterns and dependency edges.
  pub fn destroy(&self) {
    if let Some(handle) = lock(&self.inner.warming_task).take() {
      handle.abort();
    }
    self.inner.tiers.destroy();
    lock(&self.inner.access).clear();
    lock(&self.inner.dependencies).clear();
  }
}
