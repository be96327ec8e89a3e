//! SQLite-backed offline queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{OfflineOperation, OfflineQueue, QueuedOperation};
use crate::error::{Error, Result};
use crate::optimistic::Operation;

/// Queue persisted in a single SQLite table.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
-- Pending mutations in arrival order
CREATE TABLE IF NOT EXISTS offline_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    operation TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    data BLOB,
    queued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;

impl SqliteQueue {
  /// Open or create the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run queue migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

fn operation_name(operation: Operation) -> &'static str {
  match operation {
    Operation::Create => "create",
    Operation::Update => "update",
    Operation::Delete => "delete",
  }
}

fn parse_operation(name: &str) -> Result<Operation> {
  match name {
    "create" => Ok(Operation::Create),
    "update" => Ok(Operation::Update),
    "delete" => Ok(Operation::Delete),
    other => Err(Error::Storage(format!("Unknown queued operation '{}'", other))),
  }
}

impl OfflineQueue for SqliteQueue {
  fn enqueue(&self, op: OfflineOperation) -> Result<String> {
    let conn = self.conn()?;
    let id = Uuid::new_v4().to_string();
    let data = op.data.as_ref().map(serde_json::to_vec).transpose()?;

    conn.execute(
      "INSERT INTO offline_queue (id, operation, entity_type, entity_id, data, queued_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        id,
        operation_name(op.operation),
        op.entity_type,
        op.entity_id,
        data,
        Utc::now().to_rfc3339()
      ],
    )?;
    Ok(id)
  }

  fn pending(&self) -> Result<Vec<QueuedOperation>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT id, operation, entity_type, entity_id, data, queued_at, attempts
       FROM offline_queue ORDER BY seq",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<String>>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, u32>(6)?,
        ))
      })?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(
        |(id, operation, entity_type, entity_id, data, queued_at, attempts)| -> Result<QueuedOperation> {
          let data = data.map(|d| serde_json::from_slice(&d)).transpose()?;
          let queued_at = DateTime::parse_from_rfc3339(&queued_at)
            .map_err(|e| Error::Storage(format!("Failed to parse '{}': {}", queued_at, e)))?
            .with_timezone(&Utc);
          Ok(QueuedOperation {
            id,
            operation: OfflineOperation {
              operation: parse_operation(&operation)?,
              entity_type,
              entity_id,
              data,
            },
            queued_at,
            attempts,
          })
        },
      )
      .collect()
  }

  fn remove(&self, id: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])?;
    Ok(())
  }

  fn record_attempt(&self, id: &str, error: &str) -> Result<u32> {
    let conn = self.conn()?;
    conn.execute(
      "UPDATE offline_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )?;
    conn
      .query_row(
        "SELECT attempts FROM offline_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()?
      .ok_or_else(|| Error::Storage(format!("queued operation {} not found", id)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    let id = {
      let queue = SqliteQueue::open(&path).unwrap();
      let id = queue.update("product", "42", json!({"price": 9})).unwrap();
      queue.delete("product", "43").unwrap();
      id
    };

    let queue = SqliteQueue::open(&path).unwrap();
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].operation.entity_id.as_deref(), Some("42"));
    assert_eq!(pending[0].operation.data, Some(json!({"price": 9})));
    assert_eq!(pending[1].operation.operation, Operation::Delete);
    assert_eq!(pending[1].operation.data, None);
  }

  #[test]
  fn test_attempts_and_remove() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let id = queue.create("cart-item", json!({"sku": "X"})).unwrap();

    assert_eq!(queue.record_attempt(&id, "offline").unwrap(), 1);
    assert_eq!(queue.record_attempt(&id, "offline").unwrap(), 2);
    assert_eq!(queue.pending().unwrap()[0].attempts, 2);

    queue.remove(&id).unwrap();
    assert!(queue.pending().unwrap().is_empty());
    assert!(queue.record_attempt(&id, "offline").is_err());
  }
}
