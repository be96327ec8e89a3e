use chrono::Utc;
use std::sync::Mutex;
use uuid::Uuid;

use super::{OfflineOperation, OfflineQueue, QueuedOperation};
use crate::error::{Error, Result};

/// Process-local queue. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryQueue {
  items: Mutex<Vec<QueuedOperation>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn items(&self) -> std::sync::MutexGuard<'_, Vec<QueuedOperation>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl OfflineQueue for MemoryQueue {
  fn enqueue(&self, operation: OfflineOperation) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    self.items().push(QueuedOperation {
      id: id.clone(),
      operation,
      queued_at: Utc::now(),
      attempts: 0,
    });
    Ok(id)
  }

  fn pending(&self) -> Result<Vec<QueuedOperation>> {
    Ok(self.items().clone())
  }

  fn remove(&self, id: &str) -> Result<()> {
    self.items().retain(|op| op.id != id);
    Ok(())
  }

  fn record_attempt(&self, id: &str, _error: &str) -> Result<u32> {
    let mut items = self.items();
    let item = items
      .iter_mut()
      .find(|op| op.id == id)
      .ok_or_else(|| Error::Storage(format!("queued operation {} not found", id)))?;
    item.attempts += 1;
    Ok(item.attempts)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::optimistic::Operation;
  use serde_json::json;

  #[test]
  fn test_fifo_and_attempts() {
    let queue = MemoryQueue::new();
    let first = queue.create("cart-item", json!({"sku": "X"})).unwrap();
    let second = queue.delete("cart-item", "7").unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first);
    assert_eq!(pending[1].operation.operation, Operation::Delete);

    assert_eq!(queue.record_attempt(&first, "boom").unwrap(), 1);
    assert_eq!(queue.record_attempt(&first, "boom").unwrap(), 2);
    queue.remove(&first).unwrap();
    assert_eq!(queue.pending().unwrap()[0].id, second);
    assert!(queue.record_attempt(&first, "gone").is_err());
  }
}
