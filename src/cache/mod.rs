//! Bounded in-memory caching with TTL expiry and tag invalidation.
//!
//! This module provides:
//! - [`CacheStore`]: one bounded store with priority/LRU/LFU eviction and GC
//! - [`CacheTiers`]: four stores partitioned by data domain, routed by tags
//! - [`CacheResult`]: read results annotated with where the data came from

mod entry;
mod store;
mod tiers;
mod traits;

pub use entry::{estimate_size, CacheEntry, Priority, SetOptions};
pub use store::{CacheStats, CacheStore};
pub use tiers::{CacheTiers, Tier};
pub use traits::{CacheResult, CacheSource};
