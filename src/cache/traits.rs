//! Result types describing where a read was served from.

/// Result from a strategy read, including the data and its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Fresh data straight from the remote.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Data served from cache. `is_stale` marks a read that also kicked off
  /// a background revalidation.
  pub fn from_cache(data: T, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
    }
  }

  /// Cached data served because the remote failed.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache while a background refresh runs
  CacheStale,
  /// Network failed, serving whatever the cache still had
  Offline,
}
