//! Four independently bounded stores, partitioned by data domain.

use std::collections::BTreeSet;

use super::store::{CacheStats, CacheStore};
use crate::config::StoresConfig;

/// Which store a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
  General,
  Images,
  Api,
  User,
}

impl Tier {
  pub const ALL: [Tier; 4] = [Tier::General, Tier::Images, Tier::Api, Tier::User];

  /// Pick a tier from an entry's tags. Image tags win over user tags,
  /// which win over API tags.
  pub fn for_tags(tags: &BTreeSet<String>) -> Tier {
    let has = |names: &[&str]| names.iter().any(|n| tags.contains(*n));
    if has(&["image", "images"]) {
      Tier::Images
    } else if has(&["user", "cart"]) {
      Tier::User
    } else if has(&["api"]) {
      Tier::Api
    } else {
      Tier::General
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Tier::General => "general",
      Tier::Images => "images",
      Tier::Api => "api",
      Tier::User => "user",
    }
  }
}

/// The general, image, API and user-scoped stores.
///
/// Keeping them apart means a flood of image data cannot evict a cart.
#[derive(Clone, Debug)]
pub struct CacheTiers {
  general: CacheStore,
  images: CacheStore,
  api: CacheStore,
  user: CacheStore,
}

impl CacheTiers {
  pub fn new(config: &StoresConfig) -> Self {
    Self {
      general: CacheStore::new(Tier::General.name(), config.general.clone()),
      images: CacheStore::new(Tier::Images.name(), config.images.clone()),
      api: CacheStore::new(Tier::Api.name(), config.api.clone()),
      user: CacheStore::new(Tier::User.name(), config.user.clone()),
    }
  }

  pub fn store(&self, tier: Tier) -> &CacheStore {
    match tier {
      Tier::General => &self.general,
      Tier::Images => &self.images,
      Tier::Api => &self.api,
      Tier::User => &self.user,
    }
  }

  pub fn route(&self, tags: &BTreeSet<String>) -> &CacheStore {
    self.store(Tier::for_tags(tags))
  }

  fn all(&self) -> impl Iterator<Item = &CacheStore> {
    Tier::ALL.into_iter().map(move |t| self.store(t))
  }

  /// Delete `key` from whichever stores hold it.
  pub fn delete_everywhere(&self, key: &str) -> bool {
    self.all().fold(false, |found, s| s.delete(key) || found)
  }

  pub fn is_resident(&self, key: &str) -> bool {
    self.all().any(|s| s.has(key))
  }

  pub fn clear_by_tags(&self, tags: &BTreeSet<String>) -> usize {
    self.all().map(|s| s.clear_by_tags(tags)).sum()
  }

  pub fn clear(&self) {
    self.all().for_each(CacheStore::clear);
  }

  pub fn stats(&self) -> Vec<(Tier, CacheStats)> {
    Tier::ALL
      .into_iter()
      .map(|t| (t, self.store(t).stats()))
      .collect()
  }

  pub fn start_gc(&self) {
    self.all().for_each(CacheStore::start_gc);
  }

  pub fn destroy(&self) {
    self.all().for_each(CacheStore::destroy);
  }
}
