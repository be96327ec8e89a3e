//! Named event subscriptions for mutation lifecycle changes.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::update::OptimisticUpdate;
use crate::offline::QueuedOperation;

/// Lifecycle events emitted by the optimistic manager.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
  /// Speculative data was written to the cache
  OptimisticUpdate(OptimisticUpdate),
  UpdateConfirmed {
    update: OptimisticUpdate,
    data: Value,
  },
  UpdateFailed {
    update: OptimisticUpdate,
    error: String,
  },
  UpdateRolledBack(OptimisticUpdate),
  UpdateRetry {
    update: OptimisticUpdate,
    delay: Duration,
  },
  UpdateQueuedForSync {
    update: OptimisticUpdate,
    queue_id: String,
  },
  OfflineOperationSynced {
    operation: QueuedOperation,
    data: Value,
  },
  OfflineOperationFailed {
    operation: QueuedOperation,
    error: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationEventKind {
  OptimisticUpdate,
  UpdateConfirmed,
  UpdateFailed,
  UpdateRolledBack,
  UpdateRetry,
  UpdateQueuedForSync,
  OfflineOperationSynced,
  OfflineOperationFailed,
}

impl MutationEventKind {
  pub fn name(self) -> &'static str {
    match self {
      Self::OptimisticUpdate => "optimisticUpdate",
      Self::UpdateConfirmed => "updateConfirmed",
      Self::UpdateFailed => "updateFailed",
      Self::UpdateRolledBack => "updateRolledBack",
      Self::UpdateRetry => "updateRetry",
      Self::UpdateQueuedForSync => "updateQueuedForSync",
      Self::OfflineOperationSynced => "offlineOperationSynced",
      Self::OfflineOperationFailed => "offlineOperationFailed",
    }
  }
}

impl MutationEvent {
  pub fn kind(&self) -> MutationEventKind {
    match self {
      Self::OptimisticUpdate(_) => MutationEventKind::OptimisticUpdate,
      Self::UpdateConfirmed { .. } => MutationEventKind::UpdateConfirmed,
      Self::UpdateFailed { .. } => MutationEventKind::UpdateFailed,
      Self::UpdateRolledBack(_) => MutationEventKind::UpdateRolledBack,
      Self::UpdateRetry { .. } => MutationEventKind::UpdateRetry,
      Self::UpdateQueuedForSync { .. } => MutationEventKind::UpdateQueuedForSync,
      Self::OfflineOperationSynced { .. } => MutationEventKind::OfflineOperationSynced,
      Self::OfflineOperationFailed { .. } => MutationEventKind::OfflineOperationFailed,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handle returned by [`EventBus::on`]. Events arrive on `receiver`.
#[derive(Debug)]
pub struct Subscription {
  pub id: SubscriptionId,
  pub receiver: mpsc::UnboundedReceiver<MutationEvent>,
}

type Listeners = HashMap<SubscriptionId, (MutationEventKind, mpsc::UnboundedSender<MutationEvent>)>;

#[derive(Debug, Default)]
pub struct EventBus {
  next_id: AtomicU64,
  listeners: Mutex<Listeners>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Subscribe to one event kind.
  pub fn on(&self, kind: MutationEventKind) -> Subscription {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let (tx, receiver) = mpsc::unbounded_channel();
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, (kind, tx));
    Subscription { id, receiver }
  }

  pub fn off(&self, id: SubscriptionId) -> bool {
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id)
      .is_some()
  }

  /// Deliver to every listener of the event's kind, dropping closed ones.
  pub fn emit(&self, event: MutationEvent) {
    let kind = event.kind();
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|_, (wanted, tx)| *wanted != kind || tx.send(event.clone()).is_ok());
  }
}
