//! Sharing of concurrent fetches for the same key.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;

pub(crate) type FetchFuture = BoxFuture<'static, Result<Value>>;

/// A type-erased, re-invocable remote fetch.
pub(crate) type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Map of storage key to the fetch currently running for it.
///
/// A second caller for a key awaits the first caller's future instead of
/// issuing its own request.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
  pending: Arc<Mutex<HashMap<String, Shared<FetchFuture>>>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the fetch running for `key`, or start one with `fetcher`.
  pub fn fetch(&self, key: &str, fetcher: &Fetcher) -> Shared<FetchFuture> {
    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(running) = pending.get(key) {
      return running.clone();
    }

    let map = Arc::clone(&self.pending);
    let owned_key = key.to_string();
    let request = fetcher();
    let shared = async move {
      let result = request.await;
      map
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&owned_key);
      result
    }
    .boxed()
    .shared();

    pending.insert(key.to_string(), shared.clone());
    shared
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}
