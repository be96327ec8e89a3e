//! Replay of queued operations once connectivity returns.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NetworkStatus, OfflineQueue, QueuedOperation};
use crate::error::Result;

/// Outcome of replaying one queued operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Synced {
    operation: QueuedOperation,
    data: Value,
  },
  /// Replay failed `max_attempts` times; the operation was dropped
  Failed {
    operation: QueuedOperation,
    error: String,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
  /// Operations still queued after this pass
  pub remaining: usize,
}

type ReplayFn = Arc<dyn Fn(QueuedOperation) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct SyncInner {
  queue: Arc<dyn OfflineQueue>,
  network: Arc<dyn NetworkStatus>,
  replay: ReplayFn,
  max_attempts: u32,
  events: broadcast::Sender<SyncEvent>,
  task: Mutex<Option<JoinHandle<()>>>,
}

/// Replays the offline queue through a caller-supplied handler.
#[derive(Clone)]
pub struct OfflineSync {
  inner: Arc<SyncInner>,
}

impl OfflineSync {
  pub fn new<F, Fut>(
    queue: Arc<dyn OfflineQueue>,
    network: Arc<dyn NetworkStatus>,
    max_attempts: u32,
    replay: F,
  ) -> Self
  where
    F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let (events, _rx) = broadcast::channel(256);
    Self {
      inner: Arc::new(SyncInner {
        queue,
        network,
        replay: Arc::new(move |op| replay(op).boxed()),
        max_attempts: max_attempts.max(1),
        events,
        task: Mutex::new(None),
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }

  /// Replay queued operations in order while online.
  ///
  /// A failing operation stops the pass so later operations never overtake
  /// it; it is dropped and reported once it has failed `max_attempts` times.
  pub async fn replay_pending(&self) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let pending = self.inner.queue.pending()?;
    if !self.inner.network.is_online() {
      report.remaining = pending.len();
      return Ok(report);
    }

    let mut iter = pending.into_iter();
    for operation in iter.by_ref() {
      match (self.inner.replay)(operation.clone()).await {
        Ok(data) => {
          self.inner.queue.remove(&operation.id)?;
          debug!(id = %operation.id, entity = %operation.operation.entity_type, "replayed offline operation");
          report.synced += 1;
          self.emit(SyncEvent::Synced { operation, data });
        }
        Err(e) => {
          let error = e.to_string();
          let attempts = self.inner.queue.record_attempt(&operation.id, &error)?;
          if attempts >= self.inner.max_attempts {
            self.inner.queue.remove(&operation.id)?;
            warn!(id = %operation.id, attempts, error = %error, "dropping offline operation");
            report.failed += 1;
            self.emit(SyncEvent::Failed { operation, error });
          } else {
            report.remaining += 1;
            break;
          }
        }
      }
    }
    report.remaining += iter.count();

    if report.synced + report.failed > 0 {
      info!(synced = report.synced, failed = report.failed, remaining = report.remaining, "offline sync pass");
    }
    Ok(report)
  }

  /// Replay every `period` until [`destroy`](Self::destroy) is called.
  pub fn start(&self, period: Duration) {
    let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        if let Err(e) = (OfflineSync { inner }).replay_pending().await {
          warn!(error = %e, "offline sync pass failed");
        }
      }
    });

    let mut slot = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = slot.replace(handle) {
      previous.abort();
    }
  }

  pub fn destroy(&self) {
    let handle = self
      .inner
      .task
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(handle) = handle {
      handle.abort();
    }
  }
}
