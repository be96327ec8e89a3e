//! Bookkeeping for in-flight speculative mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::offline::OfflineOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

/// Lifecycle of a mutation: `Pending -> Confirmed`, `Pending -> Failed ->
/// RolledBack`, or `Pending -> Failed -> Pending` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
  Pending,
  Confirmed,
  Failed,
  RolledBack,
}

/// One speculative mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimisticUpdate {
  pub id: Uuid,
  pub entity_type: String,
  /// Temporary client id for creates
  pub entity_id: String,
  pub operation: Operation,
  /// Cached data before the mutation; `None` for creates
  pub original_data: Option<Value>,
  /// Speculative data; `None` for deletes
  pub optimistic_data: Option<Value>,
  pub timestamp: DateTime<Utc>,
  pub status: UpdateStatus,
  pub error: Option<String>,
  pub retry_count: u32,
}

impl OptimisticUpdate {
  pub(crate) fn new(
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    original_data: Option<Value>,
    optimistic_data: Option<Value>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      entity_type: entity_type.to_string(),
      entity_id: entity_id.to_string(),
      operation,
      original_data,
      optimistic_data,
      timestamp: Utc::now(),
      status: UpdateStatus::Pending,
      error: None,
      retry_count: 0,
    }
  }

  pub fn cache_key(&self) -> String {
    entity_key(&self.entity_type, &self.entity_id)
  }

  /// The operation to hand to the offline queue.
  pub(crate) fn to_offline(&self) -> OfflineOperation {
    match self.operation {
      Operation::Create => OfflineOperation {
        operation: Operation::Create,
        entity_type: self.entity_type.clone(),
        entity_id: None,
        data: self.optimistic_data.clone().map(strip_id),
      },
      Operation::Update => OfflineOperation {
        operation: Operation::Update,
        entity_type: self.entity_type.clone(),
        entity_id: Some(self.entity_id.clone()),
        data: self.optimistic_data.clone(),
      },
      Operation::Delete => OfflineOperation {
        operation: Operation::Delete,
        entity_type: self.entity_type.clone(),
        entity_id: Some(self.entity_id.clone()),
        data: None,
      },
    }
  }
}

/// Cache key of an entity.
pub fn entity_key(entity_type: &str, id: &str) -> String {
  format!("{}:{}", entity_type, id)
}

pub(crate) fn temporary_id() -> String {
  format!("temp_{}", Uuid::new_v4().simple())
}

/// Shallow merge: top-level fields of `changes` replace those of `base`.
/// Non-object inputs are replaced wholesale.
pub(crate) fn shallow_merge(base: &Value, changes: &Value) -> Value {
  match (base, changes) {
    (Value::Object(base), Value::Object(changes)) => {
      let mut merged = base.clone();
      for (k, v) in changes {
        merged.insert(k.clone(), v.clone());
      }
      Value::Object(merged)
    }
    _ => changes.clone(),
  }
}

/// The `id` field of a server response, as a string.
pub(crate) fn server_id(data: &Value) -> Option<String> {
  match data.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub(crate) fn with_id(data: Value, id: &str) -> Value {
  match data {
    Value::Object(mut map) => {
      map.insert("id".to_string(), Value::String(id.to_string()));
      Value::Object(map)
    }
    other => other,
  }
}

fn strip_id(data: Value) -> Value {
  match data {
    Value::Object(mut map) => {
      map.remove("id");
      Value::Object(map)
    }
    other => other,
  }
}
