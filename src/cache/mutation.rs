//! In-flight optimistic mutations.

use std::sync::Arc;

use super::traits::CacheKey;

/// An optimistic change that has been applied to the cache but not yet
/// confirmed or rejected by the server.
///
/// The handle owns the snapshot that existed immediately before the transform
/// ran. Hand it back to [`QueryCache::commit_mutation`] or
/// [`QueryCache::rollback_mutation`] once the request settles.
///
/// [`QueryCache::commit_mutation`]: super::QueryCache::commit_mutation
/// [`QueryCache::rollback_mutation`]: super::QueryCache::rollback_mutation
#[derive(Debug)]
#[must_use = "a mutation must be committed or rolled back"]
pub struct MutationHandle<T> {
  pub(super) id: u64,
  pub(super) key: CacheKey,
  pub(super) previous: Option<Arc<T>>,
  /// Confirmed value at start, to tell whether the server moved on since
  pub(super) base: Option<Arc<T>>,
  pub(super) optimistic: Option<Arc<T>>,
  pub(super) dependents: Vec<CacheKey>,
}

impl<T> MutationHandle<T> {
  /// Monotonic id, in the order mutations were started.
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// The value that will be restored on rollback, unless the server confirms
  /// a newer one first.
  pub fn previous(&self) -> Option<&Arc<T>> {
    self.previous.as_ref()
  }

  pub fn optimistic(&self) -> Option<&Arc<T>> {
    self.optimistic.as_ref()
  }

  /// False when the key was not cached at start; only the request runs.
  pub fn was_applied(&self) -> bool {
    self.optimistic.is_some()
  }

  /// Also invalidate `key` when this mutation commits.
  pub fn invalidates(mut self, key: CacheKey) -> Self {
    if !self.dependents.contains(&key) {
      self.dependents.push(key);
    }
    self
  }

  pub fn dependents(&self) -> &[CacheKey] {
    &self.dependents
  }
}
