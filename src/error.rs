//! Error type shared by the cache, strategy and mutation layers.

use std::time::Duration;

/// Errors surfaced by the resilience layer.
///
/// The type is `Clone` because a single in-flight fetch can be awaited by
/// several callers, each of which receives the same outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
  /// A cache-only read found no valid entry.
  #[error("Key not cached: {key}")]
  NotCached { key: String },

  /// An optimistic update or delete targeted an entity absent from the cache.
  #[error("Entity {entity_type}:{id} not found in cache")]
  NotFound { entity_type: String, id: String },

  /// A remote fetch or server action failed.
  #[error("Remote call failed: {0}")]
  Remote(String),

  /// A server action did not settle before its deadline.
  #[error("Server action timed out after {0:?}")]
  Timeout(Duration),

  /// The mutation was cancelled before the server answered.
  #[error("Optimistic update {update_id} was cancelled")]
  Cancelled { update_id: String },

  /// A batch server action returned the wrong number of results.
  #[error("Batch returned {actual} results for {expected} operations")]
  BatchMismatch { expected: usize, actual: usize },

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Build a remote error from anything displayable.
  pub fn remote(err: impl std::fmt::Display) -> Self {
    Error::Remote(err.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
