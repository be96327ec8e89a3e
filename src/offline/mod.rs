//! Offline operation queue, network status and replay.
//!
//! Mutations that cannot reach the server are serialized into an
//! [`OfflineQueue`]. [`OfflineSync`] replays them once the
//! [`NetworkStatus`] source reports connectivity again and broadcasts a
//! [`SyncEvent`] per replayed operation.

mod memory;
mod sqlite;
mod sync;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::optimistic::Operation;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;
pub use sync::{OfflineSync, SyncEvent, SyncReport};

/// A mutation waiting to be sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
  pub operation: Operation,
  pub entity_type: String,
  /// Absent for creates
  pub entity_id: Option<String>,
  /// Absent for deletes
  pub data: Option<Value>,
}

/// An [`OfflineOperation`] as stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: String,
  #[serde(flatten)]
  pub operation: OfflineOperation,
  pub queued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
}

/// Storage for operations awaiting replay, in FIFO order.
pub trait OfflineQueue: Send + Sync {
  /// Append an operation. Returns its queue id.
  fn enqueue(&self, operation: OfflineOperation) -> Result<String>;

  /// All queued operations, oldest first.
  fn pending(&self) -> Result<Vec<QueuedOperation>>;

  fn remove(&self, id: &str) -> Result<()>;

  /// Count a failed replay. Returns the new attempt count.
  fn record_attempt(&self, id: &str, error: &str) -> Result<u32>;

  fn create(&self, entity_type: &str, data: Value) -> Result<String> {
    self.enqueue(OfflineOperation {
      operation: Operation::Create,
      entity_type: entity_type.to_string(),
      entity_id: None,
      data: Some(data),
    })
  }

  fn update(&self, entity_type: &str, id: &str, data: Value) -> Result<String> {
    self.enqueue(OfflineOperation {
      operation: Operation::Update,
      entity_type: entity_type.to_string(),
      entity_id: Some(id.to_string()),
      data: Some(data),
    })
  }

  fn delete(&self, entity_type: &str, id: &str) -> Result<String> {
    self.enqueue(OfflineOperation {
      operation: Operation::Delete,
      entity_type: entity_type.to_string(),
      entity_id: Some(id.to_string()),
      data: None,
    })
  }
}

/// Synchronous connectivity check.
pub trait NetworkStatus: Send + Sync {
  fn is_online(&self) -> bool;
}

/// Connectivity flag toggled by the host application.
#[derive(Debug)]
pub struct NetworkMonitor {
  online: AtomicBool,
}

impl NetworkMonitor {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

impl NetworkStatus for NetworkMonitor {
  fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}
