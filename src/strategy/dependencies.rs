//! Directed `dependency key -> dependent storage keys` relation.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct DependencyGraph {
  edges: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record that writes to `dependency` invalidate `dependent`.
  pub fn add(&mut self, dependency: &str, dependent: &str) {
    self
      .edges
      .entry(dependency.to_string())
      .or_default()
      .insert(dependent.to_string());
  }

  /// Remove and return every dependent of `dependency`.
  ///
  /// A cascade consumes the edges; dependents re-register on their next read.
  pub fn take(&mut self, dependency: &str) -> BTreeSet<String> {
    self.edges.remove(dependency).unwrap_or_default()
  }

  pub fn dependents(&self, dependency: &str) -> Vec<String> {
    self
      .edges
      .get(dependency)
      .map(|d| d.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Drop edges whose dependent fails `keep`. Returns how many were dropped.
  pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
    let mut dropped = 0;
    self.edges.retain(|_, dependents| {
      let before = dependents.len();
      dependents.retain(|d| keep(d));
      dropped += before - dependents.len();
      !dependents.is_empty()
    });
    dropped
  }

  pub fn edge_count(&self) -> usize {
    self.edges.values().map(BTreeSet::len).sum()
  }

  pub fn clear(&mut self) {
    self.edges.clear();
  }
}
