//! Speculative create/update/delete ahead of server confirmation.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, MutationEvent, MutationEventKind, Subscription, SubscriptionId};
use super::retry::backoff_delay;
use super::update::{
  entity_key, server_id, shallow_merge, temporary_id, with_id, Operation, OptimisticUpdate,
  UpdateStatus,
};
use crate::cache::{CacheStore, SetOptions};
use crate::config::MutationConfig;
use crate::error::{Error, Result};
use crate::offline::{NetworkStatus, OfflineQueue, OfflineSync, SyncEvent};

/// How a mutation ended from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The server accepted the mutation and returned this data
  Confirmed(Value),
  /// The network was down; the mutation waits in the offline queue
  Queued { queue_id: String },
}

impl MutationOutcome {
  pub fn confirmed(&self) -> Option<&Value> {
    match self {
      MutationOutcome::Confirmed(data) => Some(data),
      MutationOutcome::Queued { .. } => None,
    }
  }
}

/// One entry of an optimistic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
  Create {
    entity_type: String,
    data: Value,
  },
  Update {
    entity_type: String,
    id: String,
    changes: Value,
  },
  Delete {
    entity_type: String,
    id: String,
  },
}

enum Settled<V> {
  Done(V),
  Queued(Vec<String>),
}

struct ManagerInner {
  cache: CacheStore,
  defaults: MutationConfig,
  updates: Mutex<HashMap<Uuid, OptimisticUpdate>>,
  /// Updates handed to the offline queue, by queue id
  queued: Mutex<HashMap<String, OptimisticUpdate>>,
  events: EventBus,
  queue: Arc<dyn OfflineQueue>,
  network: Arc<dyn NetworkStatus>,
  sync_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Applies mutations to the cache immediately and reconciles them with the
/// server afterwards: confirming, retrying, queueing offline, or rolling back.
#[derive(Clone)]
pub struct OptimisticManager {
  inner: Arc<ManagerInner>,
}

impl OptimisticManager {
  pub fn new(
    cache: CacheStore,
    queue: Arc<dyn OfflineQueue>,
    network: Arc<dyn NetworkStatus>,
    defaults: MutationConfig,
  ) -> Self {
    Self {
      inner: Arc::new(ManagerInner {
        cache,
        defaults,
        updates: Mutex::new(HashMap::new()),
        queued: Mutex::new(HashMap::new()),
        events: EventBus::new(),
        queue,
        network,
        sync_task: Mutex::new(None),
      }),
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn on(&self, kind: MutationEventKind) -> Subscription {
    self.inner.events.on(kind)
  }

  pub fn off(&self, id: SubscriptionId) -> bool {
    self.inner.events.off(id)
  }

  /// Create `data` under a temporary id, then re-key it on the server's id.
  pub async fn optimistic_create<T, F, Fut>(
    &self,
    entity_type: &str,
    data: Value,
    server_action: F,
    config: MutationConfig,
  ) -> Result<MutationOutcome>
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let op = BatchOperation::Create {
      entity_type: entity_type.to_string(),
      data,
    };
    self.run_single(op, server_action, config).await
  }

  /// Shallow-merge `changes` into the cached entity. Fails if it is not cached.
  pub async fn optimistic_update<T, F, Fut>(
    &self,
    entity_type: &str,
    id: &str,
    changes: Value,
    server_action: F,
    config: MutationConfig,
  ) -> Result<MutationOutcome>
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let op = BatchOperation::Update {
      entity_type: entity_type.to_string(),
      id: id.to_string(),
      changes,
    };
    self.run_single(op, server_action, config).await
  }

  /// Remove the cached entity. Fails if it is not cached.
  pub async fn optimistic_delete<T, F, Fut>(
    &self,
    entity_type: &str,
    id: &str,
    server_action: F,
    config: MutationConfig,
  ) -> Result<MutationOutcome>
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let op = BatchOperation::Delete {
      entity_type: entity_type.to_string(),
      id: id.to_string(),
    };
    self.run_single(op, server_action, config).await
  }

  /// Apply every operation up front and reconcile them against one server call.
  ///
  /// The server action returns one result per operation, in order. A failed
  /// item rolls back only that operation; a failed call rolls back all of them.
  pub async fn optimistic_batch<F, Fut>(
    &self,
    operations: Vec<BatchOperation>,
    server_action: F,
    config: MutationConfig,
  ) -> Result<Vec<Result<MutationOutcome>>>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<Result<Value>>>> + Send + 'static,
  {
    for op in &operations {
      self.check_resident(op)?;
    }
    let expected = operations.len();
    let mut ids = Vec::with_capacity(expected);
    for op in operations {
      match self.apply(op, &config) {
        Ok(update) => ids.push(update.id),
        Err(e) => {
          self.fail(&ids, &e, &config);
          return Err(e);
        }
      }
    }

    let attempt = || {
      let request = server_action();
      async move {
        let results = request.await?;
        if results.len() != expected {
          return Err(Error::BatchMismatch {
            expected,
            actual: results.len(),
          });
        }
        Ok::<_, Error>(results)
      }
      .boxed()
    };

    match self.drive(&ids, attempt, &config).await? {
      Settled::Queued(queue_ids) => Ok(
        queue_ids
          .into_iter()
          .map(|queue_id| Ok(MutationOutcome::Queued { queue_id }))
          .collect(),
      ),
      Settled::Done(results) => Ok(
        ids
          .iter()
          .zip(results)
          .map(|(id, result)| match result {
            Ok(data) => {
              if self.confirm(*id, data.clone(), &config) {
                Ok(MutationOutcome::Confirmed(data))
              } else {
                Err(Error::Cancelled {
                  update_id: id.to_string(),
                })
              }
            }
            Err(e) => {
              self.fail(&[*id], &e, &config);
              Err(e)
            }
          })
          .collect(),
      ),
    }
  }

  async fn run_single<T, F, Fut>(
    &self,
    op: BatchOperation,
    server_action: F,
    config: MutationConfig,
  ) -> Result<MutationOutcome>
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let id = self.apply(op, &config)?.id;
    let attempt = || {
      let request = server_action();
      async move {
        let response = request.await?;
        let value: Value = serde_json::to_value(response)?;
        Ok::<_, Error>(value)
      }
      .boxed()
    };

    match self.drive(&[id], attempt, &config).await? {
      Settled::Done(data) => {
        if self.confirm(id, data.clone(), &config) {
          Ok(MutationOutcome::Confirmed(data))
        } else {
          Err(Error::Cancelled {
            update_id: id.to_string(),
          })
        }
      }
      Settled::Queued(queue_ids) => Ok(MutationOutcome::Queued {
        queue_id: queue_ids.into_iter().next().unwrap_or_default(),
      }),
    }
  }

  fn check_resident(&self, op: &BatchOperation) -> Result<()> {
    match op {
      BatchOperation::Create { .. } => Ok(()),
      BatchOperation::Update {
        entity_type, id, ..
      }
      | BatchOperation::Delete { entity_type, id } => {
        if self.inner.cache.has(&entity_key(entity_type, id)) {
          Ok(())
        } else {
          Err(Error::NotFound {
            entity_type: entity_type.clone(),
            id: id.clone(),
          })
        }
      }
    }
  }

  /// Write the speculative effect of `op` and start tracking it.
  fn apply(&self, op: BatchOperation, config: &MutationConfig) -> Result<OptimisticUpdate> {
    let update = match op {
      BatchOperation::Create { entity_type, data } => {
        let temp_id = temporary_id();
        let optimistic = with_id(data, &temp_id);
        let update = OptimisticUpdate::new(
          &entity_type,
          &temp_id,
          Operation::Create,
          None,
          Some(optimistic.clone()),
        );
        self.write(&update.cache_key(), optimistic, &entity_type, config.ttl());
        update
      }
      BatchOperation::Update {
        entity_type,
        id,
        changes,
      } => {
        let key = entity_key(&entity_type, &id);
        let original = self.inner.cache.get(&key).ok_or_else(|| Error::NotFound {
          entity_type: entity_type.clone(),
          id: id.clone(),
        })?;
        let optimistic = shallow_merge(&original, &changes);
        self.write(&key, optimistic.clone(), &entity_type, config.ttl());
        OptimisticUpdate::new(
          &entity_type,
          &id,
          Operation::Update,
          Some(original),
          Some(optimistic),
        )
      }
      BatchOperation::Delete { entity_type, id } => {
        let key = entity_key(&entity_type, &id);
        let original = self.inner.cache.get(&key).ok_or_else(|| Error::NotFound {
          entity_type: entity_type.clone(),
          id: id.clone(),
        })?;
        self.inner.cache.delete(&key);
        OptimisticUpdate::new(&entity_type, &id, Operation::Delete, Some(original), None)
      }
    };

    debug!(update = %update.id, key = %update.cache_key(), operation = ?update.operation, "applied optimistic update");
    lock(&self.inner.updates).insert(update.id, update.clone());
    self.inner.events.emit(MutationEvent::OptimisticUpdate(update.clone()));
    Ok(update)
  }

  /// Run `attempt` until it succeeds, retries run out, or the network drops.
  ///
  /// Every attempt is spawned so a timed-out call may still finish; its
  /// result is then discarded.
  async fn drive<V, A>(&self, ids: &[Uuid], attempt: A, config: &MutationConfig) -> Result<Settled<V>>
  where
    V: Send + 'static,
    A: Fn() -> BoxFuture<'static, Result<V>>,
  {
    let timeout = config.timeout();
    loop {
      let handle = tokio::spawn(attempt());
      let outcome = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::remote(join_error)),
        Err(_) => Err(Error::Timeout(timeout)),
      };
      self.ensure_tracked(ids)?;

      let error = match outcome {
        Ok(value) => return Ok(Settled::Done(value)),
        Err(e) => e,
      };

      let message = error.to_string();
      let failed = self.mark(ids, |u| {
        u.status = UpdateStatus::Failed;
        u.error = Some(message.clone());
      });
      let retries = failed.first().map(|u| u.retry_count).unwrap_or(0);

      if !config.retry_on_failure || retries >= config.max_retries {
        self.fail(ids, &error, config);
        return Err(error);
      }

      if !self.inner.network.is_online() {
        return self.queue_offline(ids, config).map(Settled::Queued);
      }

      let delay = backoff_delay(retries + 1);
      for update in self.mark(ids, |u| u.retry_count += 1) {
        debug!(update = %update.id, retry = update.retry_count, ?delay, error = %message, "retrying optimistic update");
        self
          .inner
          .events
          .emit(MutationEvent::UpdateRetry { update, delay });
      }
      tokio::time::sleep(delay).await;
      self.ensure_tracked(ids)?;
      self.mark(ids, |u| u.status = UpdateStatus::Pending);
    }
  }

  /// Error out if every update in `ids` was cancelled meanwhile.
  fn ensure_tracked(&self, ids: &[Uuid]) -> Result<()> {
    let updates = lock(&self.inner.updates);
    if ids.iter().any(|id| updates.contains_key(id)) {
      Ok(())
    } else {
      Err(Error::Cancelled {
        update_id: ids.first().map(Uuid::to_string).unwrap_or_default(),
      })
    }
  }

  /// Mutate the tracked updates among `ids`; returns their new state.
  fn mark(&self, ids: &[Uuid], mut f: impl FnMut(&mut OptimisticUpdate)) -> Vec<OptimisticUpdate> {
    let mut updates = lock(&self.inner.updates);
    let mut marked = Vec::with_capacity(ids.len());
    for id in ids {
      if let Some(update) = updates.get_mut(id) {
        f(update);
        marked.push(update.clone());
      }
    }
    marked
  }

  fn take(&self, id: &Uuid) -> Option<OptimisticUpdate> {
    lock(&self.inner.updates).remove(id)
  }

  fn confirm(&self, id: Uuid, data: Value, config: &MutationConfig) -> bool {
    let Some(mut update) = self.take(&id) else {
      return false;
    };
    self.apply_confirmation(&update, &data, config.ttl());
    update.status = UpdateStatus::Confirmed;
    update.error = None;
    info!(update = %update.id, key = %update.cache_key(), "optimistic update confirmed");
    self
      .inner
      .events
      .emit(MutationEvent::UpdateConfirmed { update, data });
    true
  }

  /// Terminal failure: report it and roll back if configured.
  ///
  /// Updates are unwound newest first, so when several touch one entity the
  /// oldest snapshot is the one left in the cache.
  fn fail(&self, ids: &[Uuid], error: &Error, config: &MutationConfig) {
    for id in ids.iter().rev() {
      let Some(mut update) = self.take(id) else {
        continue;
      };
      update.status = UpdateStatus::Failed;
      update.error = Some(error.to_string());
      self.inner.events.emit(MutationEvent::UpdateFailed {
        update: update.clone(),
        error: error.to_string(),
      });

      if config.rollback_on_error {
        self.rollback(&update, config.ttl());
        update.status = UpdateStatus::RolledBack;
        self.inner.events.emit(MutationEvent::UpdateRolledBack(update));
      }
    }
  }

  fn queue_offline(&self, ids: &[Uuid], config: &MutationConfig) -> Result<Vec<String>> {
    let mut queue_ids = Vec::with_capacity(ids.len());
    for id in ids {
      let Some(update) = lock(&self.inner.updates).get(id).cloned() else {
        continue;
      };
      let queue_id = match self.inner.queue.enqueue(update.to_offline()) {
        Ok(queue_id) => queue_id,
        Err(e) => {
          self.fail(ids, &e, config);
          return Err(e);
        }
      };
      self.take(id);
      info!(update = %update.id, queue_id = %queue_id, "network offline, queued optimistic update");
      lock(&self.inner.queued).insert(queue_id.clone(), update.clone());
      self.inner.events.emit(MutationEvent::UpdateQueuedForSync {
        update,
        queue_id: queue_id.clone(),
      });
      queue_ids.push(queue_id);
    }
    Ok(queue_ids)
  }

  fn apply_confirmation(&self, update: &OptimisticUpdate, data: &Value, ttl: Option<Duration>) {
    match update.operation {
      Operation::Create => {
        let temp_key = update.cache_key();
        let key = server_id(data)
          .map(|id| entity_key(&update.entity_type, &id))
          .unwrap_or_else(|| temp_key.clone());
        self.inner.cache.delete(&temp_key);
        self.write(&key, data.clone(), &update.entity_type, ttl);
      }
      Operation::Update => {
        self.write(&update.cache_key(), data.clone(), &update.entity_type, ttl);
      }
      Operation::Delete => {
        self.inner.cache.delete(&update.cache_key());
      }
    }
  }

  /// Undo the speculative effect from the retained snapshot.
  fn rollback(&self, update: &OptimisticUpdate, ttl: Option<Duration>) {
    let key = update.cache_key();
    match (update.operation, &update.original_data) {
      (Operation::Create, _) => {
        self.inner.cache.delete(&key);
      }
      (_, Some(original)) => {
        self.write(&key, original.clone(), &update.entity_type, ttl);
      }
      (_, None) => {}
    }
    warn!(update = %update.id, key = %key, operation = ?update.operation, "rolled back optimistic update");
  }

  fn write(&self, key: &str, value: Value, entity_type: &str, ttl: Option<Duration>) {
    let mut options = SetOptions::new().with_tags([entity_type]);
    options.ttl = ttl;
    self.inner.cache.set(key, value, options);
  }

  /// Roll back a pending mutation. Its server result, if any, is ignored.
  pub fn cancel_update(&self, id: Uuid) -> bool {
    let Some(mut update) = self.take(&id) else {
      return false;
    };
    self.rollback(&update, self.inner.defaults.ttl());
    update.status = UpdateStatus::RolledBack;
    self.inner.events.emit(MutationEvent::UpdateRolledBack(update));
    true
  }

  /// In-flight mutations, oldest first.
  pub fn get_pending_updates(&self) -> Vec<OptimisticUpdate> {
    let mut pending: Vec<OptimisticUpdate> = lock(&self.inner.updates).values().cloned().collect();
    pending.sort_by_key(|u| u.timestamp);
    pending
  }

  pub fn has_pending_updates(&self) -> bool {
    !lock(&self.inner.updates).is_empty()
  }

  pub fn has_pending_update_for(&self, entity_type: &str, id: &str) -> bool {
    lock(&self.inner.updates)
      .values()
      .any(|u| u.entity_type == entity_type && u.entity_id == id)
  }

  /// Mutations waiting in the offline queue.
  pub fn queued_count(&self) -> usize {
    lock(&self.inner.queued).len()
  }

  /// Close out bookkeeping for a replayed offline operation.
  pub fn handle_sync_event(&self, event: &SyncEvent) {
    let ttl = self.inner.defaults.ttl();
    match event {
      SyncEvent::Synced { operation, data } => {
        let update = lock(&self.inner.queued).remove(&operation.id);
        if let Some(update) = update {
          self.apply_confirmation(&update, data, ttl);
          info!(update = %update.id, queue_id = %operation.id, "offline update synced");
        }
        self.inner.events.emit(MutationEvent::OfflineOperationSynced {
          operation: operation.clone(),
          data: data.clone(),
        });
      }
      SyncEvent::Failed { operation, error } => {
        let update = lock(&self.inner.queued).remove(&operation.id);
        if let Some(update) = update {
          self.rollback(&update, ttl);
        }
        self.inner.events.emit(MutationEvent::OfflineOperationFailed {
          operation: operation.clone(),
          error: error.clone(),
        });
      }
    }
  }

  /// Follow `sync`'s events until [`destroy`](Self::destroy).
  pub fn observe_sync(&self, sync: &OfflineSync) {
    let mut events = sync.subscribe();
    let manager = self.clone();
    let handle = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => manager.handle_sync_event(&event),
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "offline sync events lagged");
          }
          Err(RecvError::Closed) => break,
        }
      }
    });
    if let Some(previous) = lock(&self.inner.sync_task).replace(handle) {
      previous.abort();
    }
  }

  pub fn destroy(&self) {
    let handle = lock(&self.inner.sync_task).take();
    if let Some(handle) = handle {
      handle.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StoreConfig;
  use crate::offline::{MemoryQueue, NetworkMonitor};
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn setup(online: bool) -> (OptimisticManager, Arc<MemoryQueue>, Arc<NetworkMonitor>) {
    let cache = CacheStore::new("user", StoreConfig::default());
    let queue = Arc::new(MemoryQueue::new());
    let network = Arc::new(NetworkMonitor::new(online));
    let manager = OptimisticManager::new(cache, queue.clone(), network.clone(), MutationConfig::default());
    (manager, queue, network)
  }

  /// A server that fails its first `fail_first` calls, each after `delay`.
  fn server(
    calls: &Arc<AtomicU32>,
    fail_first: u32,
    delay: Duration,
    data: Value,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      let data = data.clone();
      async move {
        tokio::time::sleep(delay).await;
        if n < fail_first {
          Err(Error::remote("server unavailable"))
        } else {
          Ok(data)
        }
      }
      .boxed()
    }
  }

  fn seed_mug(manager: &OptimisticManager) -> Value {
    let mug = json!({"id": "1", "name": "Mug", "price": 10});
    manager.cache().set("product:1", mug.clone(), SetOptions::new());
    mug
  }

  fn drain(sub: &mut Subscription) -> Vec<MutationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = sub.receiver.try_recv() {
      events.push(event);
    }
    events
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_visible_before_confirmation() {
    let (manager, _queue, _network) = setup(true);
    seed_mug(&manager);
    let calls = Arc::new(AtomicU32::new(0));
    let confirmed = json!({"id": "1", "name": "Mug", "price": 12, "version": 2});
    let action = server(&calls, 0, Duration::from_millis(50), confirmed.clone());

    let m = manager.clone();
    let task = tokio::spawn(async move {
      m.optimistic_update("product", "1", json!({"price": 12}), action, MutationConfig::default())
        .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
      manager.cache().get("product:1"),
      Some(json!({"id": "1", "name": "Mug", "price": 12}))
    );
    assert!(manager.has_pending_update_for("product", "1"));

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, MutationOutcome::Confirmed(confirmed.clone()));
    assert_eq!(manager.cache().get("product:1"), Some(confirmed));
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_update_restores_snapshot() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let mut rolled_back = manager.on(MutationEventKind::UpdateRolledBack);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, u32::MAX, Duration::from_millis(5), Value::Null);

    let err = manager
      .optimistic_update(
        "product",
        "1",
        json!({"price": 99}),
        action,
        MutationConfig::default().with_retries(0),
      )
      .await
      .unwrap_err();

    assert_eq!(err, Error::remote("server unavailable"));
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drain(&mut rolled_back).len(), 1);
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_without_rollback_keeps_speculative_data() {
    let (manager, _queue, _network) = setup(true);
    seed_mug(&manager);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, u32::MAX, Duration::ZERO, Value::Null);

    let config = MutationConfig::default().with_retries(0).with_rollback(false);
    let result = manager
      .optimistic_update("product", "1", json!({"price": 99}), action, config)
      .await;

    assert!(result.is_err());
    assert_eq!(manager.cache().get("product:1").unwrap()["price"], 99);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_with_backoff_then_confirms() {
    let (manager, _queue, _network) = setup(true);
    seed_mug(&manager);
    let mut retries = manager.on(MutationEventKind::UpdateRetry);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, 2, Duration::ZERO, json!({"id": "1", "price": 15}));

    let started = tokio::time::Instant::now();
    let outcome = manager
      .optimistic_update("product", "1", json!({"price": 15}), action, MutationConfig::default())
      .await
      .unwrap();

    assert_eq!(outcome.confirmed(), Some(&json!({"id": "1", "price": 15})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(3_000));

    let delays: Vec<Duration> = drain(&mut retries)
      .into_iter()
      .map(|event| match event {
        MutationEvent::UpdateRetry { delay, .. } => delay,
        other => panic!("unexpected event {:?}", other),
      })
      .collect();
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhausted_rolls_back() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let mut failed = manager.on(MutationEventKind::UpdateFailed);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, u32::MAX, Duration::ZERO, Value::Null);

    let result = manager
      .optimistic_delete("product", "1", action, MutationConfig::default().with_retries(2))
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    match drain(&mut failed).as_slice() {
      [MutationEvent::UpdateFailed { update, .. }] => assert_eq!(update.retry_count, 2),
      other => panic!("unexpected events {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_rolls_back() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, 0, Duration::from_secs(60), json!({"id": "1", "price": 1}));
    let mut confirmed = manager.on(MutationEventKind::UpdateConfirmed);

    let config = MutationConfig::default()
      .with_timeout(Duration::from_millis(500))
      .with_retries(0);
    let err = manager
      .optimistic_update("product", "1", json!({"price": 1}), action, config)
      .await
      .unwrap_err();

    assert_eq!(err, Error::Timeout(Duration::from_millis(500)));
    assert_eq!(manager.cache().get("product:1"), Some(mug.clone()));

    // The abandoned call still finishes; its answer must not land anywhere.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert!(drain(&mut confirmed).is_empty());
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_rekeys_on_server_id() {
    let (manager, _queue, _network) = setup(true);
    let mut applied = manager.on(MutationEventKind::OptimisticUpdate);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(
      &calls,
      0,
      Duration::from_millis(50),
      json!({"id": "srv-1", "sku": "X"}),
    );

    let m = manager.clone();
    let task = tokio::spawn(async move {
      m.optimistic_create("cart-item", json!({"sku": "X"}), action, MutationConfig::default())
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let temp_key = match drain(&mut applied).as_slice() {
      [MutationEvent::OptimisticUpdate(update)] => {
        assert!(update.entity_id.starts_with("temp_"));
        update.cache_key()
      }
      other => panic!("unexpected events {:?}", other),
    };
    assert_eq!(manager.cache().get(&temp_key).unwrap()["sku"], "X");

    task.await.unwrap().unwrap();
    assert!(!manager.cache().has(&temp_key));
    assert_eq!(
      manager.cache().get("cart-item:srv-1"),
      Some(json!({"id": "srv-1", "sku": "X"}))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_without_server_id_keeps_temporary_key() {
    let (manager, _queue, _network) = setup(true);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, 0, Duration::ZERO, json!({"ok": true}));

    manager
      .optimistic_create("note", json!({"text": "hi"}), action, MutationConfig::default())
      .await
      .unwrap();

    let keys = manager.cache().keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("note:temp_"));
  }

  #[tokio::test]
  async fn test_update_and_delete_require_cached_entity() {
    let (manager, _queue, _network) = setup(true);
    let calls = Arc::new(AtomicU32::new(0));

    let err = manager
      .optimistic_update(
        "product",
        "404",
        json!({"price": 1}),
        server(&calls, 0, Duration::ZERO, Value::Null),
        MutationConfig::default(),
      )
      .await
      .unwrap_err();
    assert_eq!(
      err,
      Error::NotFound {
        entity_type: "product".to_string(),
        id: "404".to_string()
      }
    );

    let err = manager
      .optimistic_delete(
        "product",
        "404",
        server(&calls, 0, Duration::ZERO, Value::Null),
        MutationConfig::default(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_removes_until_failure() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, u32::MAX, Duration::from_millis(50), Value::Null);

    let m = manager.clone();
    let task = tokio::spawn(async move {
      m.optimistic_delete("product", "1", action, MutationConfig::default().with_retries(0))
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!manager.cache().has("product:1"));

    assert!(task.await.unwrap().is_err());
    assert_eq!(manager.cache().get("product:1"), Some(mug));
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_retry_hands_off_to_queue() {
    let (manager, queue, _network) = setup(false);
    seed_mug(&manager);
    let mut queued = manager.on(MutationEventKind::UpdateQueuedForSync);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, u32::MAX, Duration::ZERO, Value::Null);

    let outcome = manager
      .optimistic_update("product", "1", json!({"price": 12}), action, MutationConfig::default())
      .await
      .unwrap();

    let MutationOutcome::Queued { queue_id } = outcome else {
      panic!("expected queued outcome");
    };
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queue_id);
    assert_eq!(pending[0].operation.entity_id.as_deref(), Some("1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(!manager.has_pending_updates());
    assert_eq!(manager.queued_count(), 1);
    assert_eq!(drain(&mut queued).len(), 1);
    // Speculative data stays while queued
    assert_eq!(manager.cache().get("product:1").unwrap()["price"], 12);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_events_close_out_queued_updates() {
    let (manager, queue, network) = setup(false);
    let mug = seed_mug(&manager);
    manager
      .cache()
      .set("product:2", json!({"id": "2", "price": 5}), SetOptions::new());
    let mut synced = manager.on(MutationEventKind::OfflineOperationSynced);
    let mut failed = manager.on(MutationEventKind::OfflineOperationFailed);

    let calls = Arc::new(AtomicU32::new(0));
    for id in ["1", "2"] {
      manager
        .optimistic_update(
          "product",
          id,
          json!({"price": 50}),
          server(&calls, u32::MAX, Duration::ZERO, Value::Null),
          MutationConfig::default(),
        )
        .await
        .unwrap();
    }

    network.set_online(true);
    let replays = Arc::new(AtomicU32::new(0));
    let counter = replays.clone();
    let sync = OfflineSync::new(queue.clone(), network.clone(), 1, move |op| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Err(Error::remote("conflict"))
        } else {
          Ok(json!({"id": op.operation.entity_id, "price": 50, "synced": true}))
        }
      }
    });
    manager.observe_sync(&sync);

    let report = sync.replay_pending().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(drain(&mut failed).len(), 1);
    assert_eq!(drain(&mut synced).len(), 1);
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert_eq!(manager.cache().get("product:2").unwrap()["synced"], true);
    assert_eq!(manager.queued_count(), 0);
    manager.destroy();
  }

  #[tokio::test(start_paused = true)]
  async fn test_batch_reports_per_item_results() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    manager
      .cache()
      .set("product:2", json!({"id": "2", "price": 5}), SetOptions::new());

    let ops = vec![
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"price": 11}),
      },
      BatchOperation::Delete {
        entity_type: "product".to_string(),
        id: "2".to_string(),
      },
    ];
    let results = manager
      .optimistic_batch(
        ops,
        || async {
          Ok(vec![
            Err(Error::remote("price locked")),
            Ok(json!({"deleted": true})),
          ])
        },
        MutationConfig::default(),
      )
      .await
      .unwrap();

    assert!(results[0].is_err());
    assert_eq!(results[1], Ok(MutationOutcome::Confirmed(json!({"deleted": true}))));
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert!(!manager.cache().has("product:2"));
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test(start_paused = true)]
  async fn test_batch_call_failure_rolls_back_everything() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);

    let ops = vec![
      BatchOperation::Create {
        entity_type: "product".to_string(),
        data: json!({"name": "Cup"}),
      },
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"price": 11}),
      },
    ];
    let err = manager
      .optimistic_batch(
        ops,
        || async { Ok(vec![Ok(json!({"id": "9"}))]) },
        MutationConfig::default().with_retries(0),
      )
      .await
      .unwrap_err();

    assert_eq!(err, Error::BatchMismatch { expected: 2, actual: 1 });
    assert_eq!(manager.cache().keys(), vec!["product:1".to_string()]);
    assert_eq!(manager.cache().get("product:1"), Some(mug));
  }

  #[tokio::test(start_paused = true)]
  async fn test_batch_rollback_restores_pre_batch_state_per_entity() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let lamp = json!({"id": "2", "price": 5});
    manager.cache().set("product:2", lamp.clone(), SetOptions::new());

    let ops = vec![
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"price": 11}),
      },
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"qty": 2}),
      },
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "2".to_string(),
        changes: json!({"price": 6}),
      },
      BatchOperation::Delete {
        entity_type: "product".to_string(),
        id: "2".to_string(),
      },
    ];
    let err = manager
      .optimistic_batch(
        ops,
        || async { Err(Error::remote("down")) },
        MutationConfig::default().with_retries(0),
      )
      .await
      .unwrap_err();

    assert_eq!(err, Error::remote("down"));
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert_eq!(manager.cache().get("product:2"), Some(lamp));
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test]
  async fn test_batch_apply_failure_unwinds_earlier_operations() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);

    // The delete empties product:1, so the update after it cannot apply.
    let ops = vec![
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"price": 11}),
      },
      BatchOperation::Delete {
        entity_type: "product".to_string(),
        id: "1".to_string(),
      },
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"qty": 2}),
      },
    ];
    let result = manager
      .optimistic_batch(ops, || async { Ok(Vec::new()) }, MutationConfig::default())
      .await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert_eq!(manager.cache().get("product:1"), Some(mug));
    assert!(!manager.has_pending_updates());
  }

  #[tokio::test]
  async fn test_batch_checks_presence_before_applying() {
    let (manager, _queue, _network) = setup(true);
    seed_mug(&manager);

    let ops = vec![
      BatchOperation::Update {
        entity_type: "product".to_string(),
        id: "1".to_string(),
        changes: json!({"price": 11}),
      },
      BatchOperation::Delete {
        entity_type: "product".to_string(),
        id: "missing".to_string(),
      },
    ];
    let result = manager
      .optimistic_batch(ops, || async { Ok(Vec::new()) }, MutationConfig::default())
      .await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert_eq!(manager.cache().get("product:1").unwrap()["price"], 10);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_update_rolls_back_and_ignores_result() {
    let (manager, _queue, _network) = setup(true);
    let mug = seed_mug(&manager);
    let calls = Arc::new(AtomicU32::new(0));
    let action = server(&calls, 0, Duration::from_millis(100), json!({"id": "1", "price": 70}));

    let m = manager.clone();
    let task = tokio::spawn(async move {
      m.optimistic_update("product", "1", json!({"price": 70}), action, MutationConfig::default())
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pending = manager.get_pending_updates();
    assert_eq!(pending.len(), 1);
    assert!(manager.cancel_update(pending[0].id));
    assert!(!manager.cancel_update(pending[0].id));
    assert_eq!(manager.cache().get("product:1"), Some(mug.clone()));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(manager.cache().get("product:1"), Some(mug));
  }

  #[tokio::test(start_paused = true)]
  async fn test_event_order_for_confirmed_update() {
    let (manager, _queue, _network) = setup(true);
    seed_mug(&manager);
    let mut applied = manager.on(MutationEventKind::OptimisticUpdate);
    let mut confirmed = manager.on(MutationEventKind::UpdateConfirmed);
    let mut rolled_back = manager.on(MutationEventKind::UpdateRolledBack);
    manager.off(rolled_back.id);

    let calls = Arc::new(AtomicU32::new(0));
    manager
      .optimistic_update(
        "product",
        "1",
        json!({"price": 3}),
        server(&calls, 0, Duration::ZERO, json!({"id": "1", "price": 3})),
        MutationConfig::default(),
      )
      .await
      .unwrap();

    match drain(&mut applied).as_slice() {
      [MutationEvent::OptimisticUpdate(update)] => {
        assert_eq!(update.status, UpdateStatus::Pending);
        assert_eq!(update.original_data.as_ref().unwrap()["price"], 10);
      }
      other => panic!("unexpected events {:?}", other),
    }
    match drain(&mut confirmed).as_slice() {
      [MutationEvent::UpdateConfirmed { update, .. }] => {
        assert_eq!(update.status, UpdateStatus::Confirmed)
      }
      other => panic!("unexpected events {:?}", other),
    }
    assert!(drain(&mut rolled_back).is_empty());
  }
}
