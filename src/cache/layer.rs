//! In-memory query cache with optimistic mutations.

use chrono::{DateTime, Duration, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CacheError, MutationError};
use crate::notice::{Notice, Notifier};

use super::mutation::MutationHandle;
use super::storage::{NoopStorage, SnapshotStorage};
use super::traits::{CacheKey, CacheResult, Cacheable, KeyPattern};

type AnyValue = Arc<dyn Any + Send + Sync>;

/// What happened to a key, as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
  /// Replaced by a server-confirmed value
  Updated,
  /// Speculatively transformed by a mutation
  Optimistic,
  /// A mutation without a server echo settled on its optimistic value
  Committed,
  /// Restored to the pre-mutation snapshot
  RolledBack,
  /// Marked stale; the next read refetches
  Invalidated,
  /// Removed from the cache
  Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
  pub key: CacheKey,
  pub change: Change,
}

/// Receives change events for one key. Re-read the cache on each event.
pub struct Subscription {
  rx: mpsc::UnboundedReceiver<CacheEvent>,
}

impl Subscription {
  /// Next pending event, without waiting.
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    self.rx.try_recv().ok()
  }
}

struct Entry {
  /// What readers see, optimistic or confirmed
  value: AnyValue,
  /// Last server-confirmed value; the only one that reaches snapshot storage
  confirmed: AnyValue,
  /// When the last authoritative value arrived
  fetched_at: DateTime<Utc>,
  invalidated: bool,
  /// Last write or release, for garbage collection
  touched_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<CacheKey, Entry>,
  observers: HashMap<CacheKey, usize>,
  subscribers: HashMap<CacheKey, Vec<mpsc::UnboundedSender<CacheEvent>>>,
  next_mutation_id: u64,
}

fn downcast<T: Cacheable>(key: &CacheKey, value: &AnyValue) -> Result<Arc<T>, CacheError> {
  Arc::clone(value)
    .downcast::<T>()
    .map_err(|_| CacheError::TypeMismatch {
      key: key.to_string(),
      expected: std::any::type_name::<T>(),
    })
}

impl Inner {
  fn read<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
    match self.entries.get(key) {
      None => Ok(None),
      Some(entry) => downcast(key, &entry.value).map(Some),
    }
  }

  fn read_confirmed<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
    match self.entries.get(key) {
      None => Ok(None),
      Some(entry) => downcast(key, &entry.confirmed).map(Some),
    }
  }

  fn insert_authoritative(&mut self, key: &CacheKey, value: AnyValue, fetched_at: DateTime<Utc>) {
    let now = Utc::now();
    self.entries.insert(
      key.clone(),
      Entry {
        confirmed: value.clone(),
        value,
        fetched_at,
        invalidated: false,
        touched_at: now,
      },
    );
  }

  /// Swap the visible value of an existing entry, keeping its confirmed value
  /// and freshness metadata.
  fn replace_value(&mut self, key: &CacheKey, value: AnyValue) -> bool {
    match self.entries.get_mut(key) {
      Some(entry) => {
        entry.value = value;
        entry.touched_at = Utc::now();
        true
      }
      None => false,
    }
  }

  fn remove(&mut self, key: &CacheKey) -> bool {
    self.entries.remove(key).is_some()
  }

  fn notify(&mut self, key: &CacheKey, change: Change) {
    if let Some(subs) = self.subscribers.get_mut(key) {
      subs.retain(|tx| {
        tx.send(CacheEvent {
          key: key.clone(),
          change,
        })
        .is_ok()
      });
      if subs.is_empty() {
        self.subscribers.remove(key);
      }
    }
  }
}

/// Client-side cache of server-derived view state.
///
/// Reads and writes are synchronous under a short lock, so a reader never sees
/// a half-applied update. Cloning is cheap and every clone shares the same
/// entries.
///
/// Concurrent mutations on the same key are not serialized: each one commits
/// or rolls back on its own, and the last to settle owns the slot. A rollback
/// that lands after a newer optimistic commit restores its own (older)
/// snapshot; one that lands after a server-confirmed value restores that.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Mutex<Inner>>,
  storage: Arc<dyn SnapshotStorage>,
  notifier: Option<Notifier>,
  /// How long before fetched data is considered stale
  stale_time: Duration,
  /// How long an unobserved entry survives
  gc_time: Duration,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryCache {
  /// Create an in-memory cache with no persistence.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      storage: Arc::new(NoopStorage),
      notifier: None,
      stale_time: Duration::minutes(1),
      gc_time: Duration::minutes(5),
    }
  }

  /// Persist confirmed snapshots to `storage`.
  pub fn with_storage(mut self, storage: impl SnapshotStorage + 'static) -> Self {
    self.storage = Arc::new(storage);
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Zero evicts an entry as soon as its last observer releases it.
  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  /// Surface mutation errors through `notifier`.
  pub fn with_notifier(mut self, notifier: Notifier) -> Self {
    self.notifier = Some(notifier);
    self
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // Every write is a single map operation, so a poisoned lock still guards
    // consistent data.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_entry_stale(&self, entry: &Entry) -> bool {
    entry.invalidated || Utc::now() - entry.fetched_at >= self.stale_time
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Current value for `key`, optimistic or confirmed.
  pub fn get<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
    self.lock().read(key)
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// Missing keys count as stale.
  pub fn is_stale(&self, key: &CacheKey) -> bool {
    let inner = self.lock();
    inner
      .entries
      .get(key)
      .map(|entry| self.is_entry_stale(entry))
      .unwrap_or(true)
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Register for change events on `key`.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .lock()
      .subscribers
      .entry(key.clone())
      .or_default()
      .push(tx);
    Subscription { rx }
  }

  /// Look up a cached value with its freshness. Type mismatches count as a miss.
  fn lookup<T: Cacheable>(&self, key: &CacheKey) -> Option<(Arc<T>, DateTime<Utc>, bool)> {
    let inner = self.lock();
    let entry = inner.entries.get(key)?;
    let stale = self.is_entry_stale(entry);
    let fetched_at = entry.fetched_at;
    match inner.read::<T>(key) {
      Ok(value) => value.map(|v| (v, fetched_at, stale)),
      Err(e) => {
        warn!("Ignoring cached value: {}", e);
        None
      }
    }
  }

  /// Load a persisted snapshot into memory as a stale entry.
  fn hydrate<T: Cacheable>(&self, key: &CacheKey) -> Option<(Arc<T>, DateTime<Utc>, bool)> {
    let stored = match self.storage.load(key) {
      Ok(stored) => stored?,
      Err(e) => {
        warn!("Failed to load snapshot for {}: {}", key, e);
        return None;
      }
    };

    let value: T = match serde_json::from_slice(&stored.data) {
      Ok(value) => value,
      Err(e) => {
        warn!("Discarding unreadable snapshot for {}: {}", key, e);
        return None;
      }
    };

    let value = Arc::new(value);
    let mut inner = self.lock();
    inner.insert_authoritative(key, value.clone(), stored.cached_at);
    if let Some(entry) = inner.entries.get_mut(key) {
      entry.invalidated = true;
    }
    debug!("Hydrated {} from snapshot storage", key);
    Some((value, stored.cached_at, true))
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Fresh cached value: return it without calling `fetcher`
  /// 2. Stale or missing: call `fetcher` and store the result
  /// 3. Fetch failed but a value exists (in memory or persisted): serve it as
  ///    offline data
  pub async fn fetch<T, E, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Arc<T>>, E>
  where
    T: Cacheable,
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let cached = match self.lookup::<T>(key) {
      Some(cached) => Some(cached),
      None => self.hydrate::<T>(key),
    };

    if let Some((value, fetched_at, false)) = &cached {
      return Ok(CacheResult::from_cache(Arc::clone(value), *fetched_at));
    }

    match fetcher().await {
      Ok(data) => Ok(CacheResult::from_network(self.set(key, data))),
      Err(e) => match cached {
        Some((value, fetched_at, _)) => {
          warn!("Fetch for {} failed, serving cached value: {}", key, e);
          Ok(CacheResult::offline(value, fetched_at))
        }
        None => Err(e),
      },
    }
  }

  // ==========================================================================
  // Authoritative writes
  // ==========================================================================

  /// Store a server-confirmed value, replacing whatever is cached.
  pub fn set<T: Cacheable>(&self, key: &CacheKey, value: T) -> Arc<T> {
    self.persist(key, &value);
    let value = Arc::new(value);
    let mut inner = self.lock();
    inner.insert_authoritative(key, value.clone(), Utc::now());
    inner.notify(key, Change::Updated);
    value
  }

  /// Apply a server-originated change (e.g. a push event) to a cached value.
  ///
  /// Returns `false` if the key is not cached.
  pub fn apply_server_update<T, F>(&self, key: &CacheKey, update: F) -> Result<bool, CacheError>
  where
    T: Cacheable,
    F: Fn(&T) -> T,
  {
    Ok(self.merge_confirmed(key, update)?.is_some())
  }

  /// Apply `update` to the confirmed value and, when a mutation is in flight,
  /// to the optimistic one on top of it. Only the confirmed result is
  /// persisted. Returns the new visible value.
  fn merge_confirmed<T, F>(&self, key: &CacheKey, update: F) -> Result<Option<Arc<T>>, CacheError>
  where
    T: Cacheable,
    F: Fn(&T) -> T,
  {
    let (visible, confirmed) = {
      let mut inner = self.lock();
      let visible = inner.read::<T>(key)?;
      let confirmed = inner.read_confirmed::<T>(key)?;
      let (Some(visible), Some(confirmed)) = (visible, confirmed) else {
        return Ok(None);
      };

      let next_confirmed = Arc::new(update(confirmed.as_ref()));
      let next_visible = if Arc::ptr_eq(&visible, &confirmed) {
        next_confirmed.clone()
      } else {
        Arc::new(update(visible.as_ref()))
      };

      if let Some(entry) = inner.entries.get_mut(key) {
        entry.value = next_visible.clone();
        entry.confirmed = next_confirmed.clone();
        entry.touched_at = Utc::now();
      }
      inner.notify(key, Change::Updated);
      (next_visible, next_confirmed)
    };
    self.persist(key, confirmed.as_ref());
    Ok(Some(visible))
  }

  fn persist<T: Cacheable>(&self, key: &CacheKey, value: &T) {
    let data = match serde_json::to_vec(value) {
      Ok(data) => data,
      Err(e) => {
        warn!("Failed to serialize snapshot for {}: {}", key, e);
        return;
      }
    };
    if let Err(e) = self.storage.store(key, &data) {
      warn!("Failed to persist snapshot for {}: {}", key, e);
    }
  }

  // ==========================================================================
  // Invalidation and eviction
  // ==========================================================================

  /// Mark matching keys stale so the next read refetches.
  ///
  /// Returns how many keys matched.
  pub fn invalidate(&self, pattern: impl Into<KeyPattern>) -> usize {
    let pattern = pattern.into();
    let mut inner = self.lock();
    let keys: Vec<CacheKey> = inner
      .entries
      .keys()
      .filter(|k| pattern.matches(k))
      .cloned()
      .collect();

    for key in &keys {
      if let Some(entry) = inner.entries.get_mut(key) {
        entry.invalidated = true;
      }
      inner.notify(key, Change::Invalidated);
    }

    debug!("Invalidated {} key(s) matching {:?}", keys.len(), pattern);
    keys.len()
  }

  /// Drop matching keys from memory. Persisted snapshots are kept.
  pub fn evict(&self, pattern: impl Into<KeyPattern>) -> usize {
    let pattern = pattern.into();
    let mut inner = self.lock();
    let keys: Vec<CacheKey> = inner
      .entries
      .keys()
      .filter(|k| pattern.matches(k))
      .cloned()
      .collect();

    for key in &keys {
      inner.remove(key);
      inner.notify(key, Change::Evicted);
    }
    keys.len()
  }

  /// Drop a key from memory and from snapshot storage.
  ///
  /// For resources that no longer exist on the server.
  pub fn forget(&self, key: &CacheKey) {
    {
      let mut inner = self.lock();
      if inner.remove(key) {
        inner.notify(key, Change::Evicted);
      }
    }
    if let Err(e) = self.storage.remove(key) {
      warn!("Failed to remove snapshot for {}: {}", key, e);
    }
  }

  /// A view started observing `key`.
  pub fn retain(&self, key: &CacheKey) {
    *self.lock().observers.entry(key.clone()).or_insert(0) += 1;
  }

  /// A view stopped observing `key`. The last release starts the GC timer.
  pub fn release(&self, key: &CacheKey) {
    let mut inner = self.lock();
    let remaining = match inner.observers.get_mut(key) {
      Some(count) => {
        *count = count.saturating_sub(1);
        *count
      }
      None => return,
    };

    if remaining > 0 {
      return;
    }

    inner.observers.remove(key);
    if self.gc_time <= Duration::zero() {
      if inner.remove(key) {
        inner.notify(key, Change::Evicted);
      }
    } else if let Some(entry) = inner.entries.get_mut(key) {
      entry.touched_at = Utc::now();
    }
  }

  pub fn observer_count(&self, key: &CacheKey) -> usize {
    self.lock().observers.get(key).copied().unwrap_or(0)
  }

  /// Evict unobserved entries idle for longer than the GC time.
  pub fn collect_garbage(&self) -> usize {
    let now = Utc::now();
    let mut guard = self.lock();
    let inner = &mut *guard;

    let expired: Vec<CacheKey> = inner
      .entries
      .iter()
      .filter(|(key, entry)| {
        !inner.observers.contains_key(*key) && now - entry.touched_at >= self.gc_time
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      inner.remove(key);
      inner.notify(key, Change::Evicted);
    }

    if !expired.is_empty() {
      info!("Evicted {} idle cache entries", expired.len());
    }
    expired.len()
  }

  // ==========================================================================
  // Optimistic mutations
  // ==========================================================================

  /// Snapshot the value at `key` and replace it with `transform(value)`.
  ///
  /// On a cache miss nothing is applied and the handle records that. The
  /// transform runs under the cache lock and must not call back into the cache.
  pub fn begin_mutation<T, F>(
    &self,
    key: &CacheKey,
    transform: F,
  ) -> Result<MutationHandle<T>, CacheError>
  where
    T: Cacheable,
    F: FnOnce(&T) -> T,
  {
    let mut inner = self.lock();
    let previous = inner.read::<T>(key)?;
    let base = inner.read_confirmed::<T>(key)?;

    inner.next_mutation_id += 1;
    let id = inner.next_mutation_id;

    let optimistic = previous.as_ref().map(|prev| Arc::new(transform(prev.as_ref())));
    if let Some(value) = &optimistic {
      inner.replace_value(key, value.clone());
      inner.notify(key, Change::Optimistic);
      debug!("Mutation {} applied optimistically to {}", id, key);
    } else {
      debug!("Mutation {} on uncached {}, request only", id, key);
    }

    Ok(MutationHandle {
      id,
      key: key.clone(),
      previous,
      base,
      optimistic,
      dependents: Vec::new(),
    })
  }

  /// Settle a successful mutation.
  ///
  /// With a server echo the echo replaces the cached value; without one the
  /// optimistic value is written back (last commit wins). Dependent keys are
  /// invalidated either way.
  pub fn commit_mutation<T: Cacheable>(
    &self,
    handle: MutationHandle<T>,
    server_result: Option<T>,
  ) -> Option<Arc<T>> {
    let MutationHandle {
      id,
      key,
      optimistic,
      dependents,
      ..
    } = handle;

    let committed = match server_result {
      Some(echo) => Some(self.set(&key, echo)),
      None => {
        let mut inner = self.lock();
        match optimistic {
          Some(value) if inner.replace_value(&key, value.clone()) => {
            inner.notify(&key, Change::Committed);
            Some(value)
          }
          _ => None,
        }
      }
    };

    for dependent in dependents {
      self.invalidate(dependent);
    }

    debug!("Mutation {} committed on {}", id, key);
    committed
  }

  /// Settle a successful mutation whose server echo describes part of the
  /// cached value, e.g. one comment of a list.
  ///
  /// `reconcile` is applied to the confirmed value, which is persisted, and
  /// to the value readers see, which may still carry other in-flight changes.
  pub fn commit_mutation_with<T, F>(&self, handle: MutationHandle<T>, reconcile: F) -> Option<Arc<T>>
  where
    T: Cacheable,
    F: Fn(&T) -> T,
  {
    let key = handle.key.clone();
    self.commit_mutation(handle, None);
    match self.merge_confirmed(&key, reconcile) {
      Ok(value) => value,
      Err(e) => {
        warn!("Could not reconcile {}: {}", key, e);
        None
      }
    }
  }

  /// Restore the pre-mutation snapshot and surface `error` to the user.
  ///
  /// Never retries.
  pub fn rollback_mutation<T: Cacheable>(
    &self,
    handle: MutationHandle<T>,
    error: &MutationError,
  ) -> Option<Notice> {
    warn!("Mutation {} on {} failed: {}", handle.id, handle.key, error);
    self.revert_mutation(handle);
    self.report(error)
  }

  /// Surface a mutation error to the user without touching any key.
  pub fn report(&self, error: &MutationError) -> Option<Notice> {
    self
      .notifier
      .as_ref()
      .map(|notifier| notifier.error(error.user_message()))
  }

  /// Restore the pre-mutation snapshot without notifying the user.
  ///
  /// If the server confirmed a new value for the key while the mutation was
  /// in flight, that value is restored instead of the older snapshot.
  ///
  /// For secondary keys of a mutation whose failure is reported once through
  /// [`rollback_mutation`](Self::rollback_mutation).
  pub fn revert_mutation<T: Cacheable>(&self, handle: MutationHandle<T>) {
    let MutationHandle {
      key,
      previous,
      base,
      optimistic,
      ..
    } = handle;
    let (Some(previous), Some(_)) = (previous, optimistic) else {
      return;
    };

    let mut inner = self.lock();
    let restore = match (inner.read_confirmed::<T>(&key), base) {
      (Ok(Some(confirmed)), Some(base)) if !Arc::ptr_eq(&confirmed, &base) => confirmed,
      _ => previous,
    };
    if inner.replace_value(&key, restore) {
      inner.notify(&key, Change::RolledBack);
    }
  }

  /// Run a single-key mutation end to end: apply `transform`, await
  /// `request`, then commit or roll back.
  ///
  /// `request` should resolve to the server's echo of the new value, or
  /// `None` when the endpoint does not return state.
  pub async fn mutate<T, F, Fut>(
    &self,
    key: &CacheKey,
    transform: F,
    dependents: &[CacheKey],
    request: Fut,
  ) -> Result<Option<Arc<T>>, MutationError>
  where
    T: Cacheable,
    F: FnOnce(&T) -> T,
    Fut: Future<Output = Result<Option<T>, MutationError>>,
  {
    let mut handle = self.begin_mutation(key, transform).map_err(|e| {
      let err = MutationError::from(e);
      self.report(&err);
      err
    })?;
    for dependent in dependents {
      handle = handle.invalidates(dependent.clone());
    }

    match request.await {
      Ok(echo) => Ok(self.commit_mutation(handle, echo)),
      Err(err) => {
        self.rollback_mutation(handle, &err);
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::notice::{self, NoticeLevel};
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
  struct Likes {
    liked: bool,
    count: u32,
  }

  impl Cacheable for Likes {
    fn resource() -> &'static str {
      "commentLikes"
    }
  }

  #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
  struct Title(String);

  impl Cacheable for Title {
    fn resource() -> &'static str {
      "title"
    }
  }

  fn toggle(likes: &Likes) -> Likes {
    Likes {
      liked: !likes.liked,
      count: if likes.liked {
        likes.count - 1
      } else {
        likes.count + 1
      },
    }
  }

  fn key() -> CacheKey {
    CacheKey::of::<Likes>("c1")
  }

  fn unliked() -> Likes {
    Likes {
      liked: false,
      count: 3,
    }
  }

  fn liked() -> Likes {
    Likes {
      liked: true,
      count: 4,
    }
  }

  #[test]
  fn test_begin_applies_transform_synchronously() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let handle = cache.begin_mutation(&key(), toggle).unwrap();
    assert!(handle.was_applied());
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
    assert_eq!(handle.previous().map(|p| p.as_ref()), Some(&unliked()));

    cache.commit_mutation(handle, None);
  }

  #[test]
  fn test_begin_on_miss_is_noop() {
    let cache = QueryCache::new();
    let handle = cache.begin_mutation(&key(), toggle).unwrap();

    assert!(!handle.was_applied());
    assert!(!cache.contains(&key()));

    // Nothing to restore and nothing to write back
    assert!(cache.commit_mutation(handle, None).is_none());
    assert!(!cache.contains(&key()));
  }

  #[test]
  fn test_rollback_restores_exact_snapshot() {
    let cache = QueryCache::new();
    let original = cache.set(&key(), unliked());

    let errors = [
      MutationError::Network("connection reset".to_string()),
      MutationError::Server {
        status: 500,
        message: String::new(),
      },
      MutationError::Validation("rejected".to_string()),
    ];

    for error in errors {
      let handle = cache.begin_mutation(&key(), toggle).unwrap();
      cache.rollback_mutation(handle, &error);
      let restored = cache.get::<Likes>(&key()).unwrap().unwrap();
      assert!(Arc::ptr_eq(&restored, &original));
    }
  }

  #[test]
  fn test_commit_with_echo_replaces_optimistic_value() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let handle = cache.begin_mutation(&key(), toggle).unwrap();
    // Someone else liked it at the same time
    let echo = Likes {
      liked: true,
      count: 5,
    };
    cache.commit_mutation(handle, Some(echo.clone()));

    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&echo));
  }

  #[test]
  fn test_commit_invalidates_dependents() {
    let cache = QueryCache::new();
    let list = CacheKey::new("comments", "p1");
    cache.set(&key(), unliked());
    cache.set(&list, Title("list".to_string()));
    assert!(!cache.is_stale(&list));

    let handle = cache
      .begin_mutation(&key(), toggle)
      .unwrap()
      .invalidates(list.clone())
      .invalidates(key());
    cache.commit_mutation(handle, None);

    assert!(cache.is_stale(&list));
    assert!(cache.is_stale(&key()));
    // The optimistic value survives until the refetch
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
  }

  #[test]
  fn test_server_error_reverts_and_notifies() {
    let (notifier, mut tray) = notice::channel(Duration::minutes(1));
    let cache = QueryCache::new().with_notifier(notifier);
    cache.set(&key(), unliked());

    let handle = cache.begin_mutation(&key(), toggle).unwrap();
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));

    let notice = cache.rollback_mutation(
      handle,
      &MutationError::Server {
        status: 500,
        message: String::new(),
      },
    );

    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&unliked()));
    assert_eq!(notice.map(|n| n.level), Some(NoticeLevel::Error));
    tray.poll();
    assert_eq!(tray.active().len(), 1);
    assert_eq!(tray.active()[0].message, "Something went wrong (500)");
  }

  #[test]
  fn test_concurrent_mutations_last_commit_wins() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    // Two quick toggles: like, then unlike
    let first = cache.begin_mutation(&key(), toggle).unwrap();
    let second = cache.begin_mutation(&key(), toggle).unwrap();
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&unliked()));

    // Responses arrive out of order. Whatever commits last owns the slot,
    // even though it reflects the older user action.
    cache.commit_mutation(second, None);
    cache.commit_mutation(first, None);
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
  }

  #[test]
  fn test_late_rollback_keeps_newer_echo() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let first = cache.begin_mutation(&key(), toggle).unwrap();
    let second = cache.begin_mutation(&key(), toggle).unwrap();

    // The server confirms the second toggle and echoes activity from others
    let echo = Likes {
      liked: false,
      count: 7,
    };
    cache.commit_mutation(second, Some(echo.clone()));
    cache.rollback_mutation(first, &MutationError::Network("timeout".to_string()));

    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&echo));
  }

  #[test]
  fn test_late_rollback_clobbers_newer_optimistic_commit() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let first = cache.begin_mutation(&key(), toggle).unwrap();
    let second = cache.begin_mutation(&key(), toggle).unwrap();

    // Known limitation: without an echo the first snapshot wins
    cache.commit_mutation(second, None);
    cache.rollback_mutation(first, &MutationError::Network("timeout".to_string()));

    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&unliked()));
  }

  #[test]
  fn test_type_mismatch() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let err = cache.get::<Title>(&key()).unwrap_err();
    assert!(matches!(err, CacheError::TypeMismatch { .. }));
    assert!(cache
      .begin_mutation::<Title, _>(&key(), |t| t.clone())
      .is_err());
  }

  #[tokio::test]
  async fn test_invalidate_twice_refetches_once() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    assert_eq!(cache.invalidate(&key()), 1);
    assert_eq!(cache.invalidate(&key()), 1);

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
      let calls = calls.clone();
      cache
        .fetch(&key(), || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, String>(liked())
        })
        .await
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
  }

  #[tokio::test]
  async fn test_fetch_fresh_hit_skips_fetcher() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let result = cache
      .fetch(&key(), || async { Err::<Likes, _>("should not be called") })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(*result.data, unliked());
  }

  #[tokio::test]
  async fn test_fetch_miss_propagates_error() {
    let cache = QueryCache::new();
    let result = cache
      .fetch(&key(), || async { Err::<Likes, _>("boom".to_string()) })
      .await;
    assert_eq!(result.unwrap_err(), "boom");
  }

  #[tokio::test]
  async fn test_stale_fetch_failure_serves_offline() {
    let cache = QueryCache::new().with_stale_time(Duration::zero());
    cache.set(&key(), unliked());

    let result = cache
      .fetch(&key(), || async { Err::<Likes, _>("offline") })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Offline);
    assert_eq!(*result.data, unliked());
  }

  #[tokio::test]
  async fn test_hydrates_from_storage_when_offline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let cache = QueryCache::new().with_storage(SqliteStorage::open(&path).unwrap());
      cache.set(&key(), unliked());
    }

    let cache = QueryCache::new().with_storage(SqliteStorage::open(&path).unwrap());
    let result = cache
      .fetch(&key(), || async { Err::<Likes, _>("offline") })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Offline);
    assert_eq!(*result.data, unliked());
    assert!(cache.is_stale(&key()));
  }

  #[tokio::test]
  async fn test_optimistic_values_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let cache = QueryCache::new().with_storage(SqliteStorage::open(&path).unwrap());
      cache.set(&key(), unliked());
      let handle = cache.begin_mutation(&key(), toggle).unwrap();
      cache.commit_mutation(handle, None);
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let stored = storage.load(&key()).unwrap().unwrap();
    let value: Likes = serde_json::from_slice(&stored.data).unwrap();
    assert_eq!(value, unliked());
  }

  fn stored(path: &std::path::Path) -> Likes {
    let storage = SqliteStorage::open(path).unwrap();
    let stored = storage.load(&key()).unwrap().unwrap();
    serde_json::from_slice(&stored.data).unwrap()
  }

  fn bump(likes: &Likes) -> Likes {
    Likes {
      count: likes.count + 10,
      ..likes.clone()
    }
  }

  #[test]
  fn test_server_update_during_mutation_persists_confirmed_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = QueryCache::new().with_storage(SqliteStorage::open(&path).unwrap());
    cache.set(&key(), unliked());

    let handle = cache.begin_mutation(&key(), toggle).unwrap();
    assert!(cache.apply_server_update::<Likes, _>(&key(), bump).unwrap());

    // Readers see the push on top of the pending like; storage never does
    assert_eq!(
      cache.get::<Likes>(&key()).unwrap().as_deref(),
      Some(&Likes {
        liked: true,
        count: 14
      })
    );
    assert_eq!(
      stored(&path),
      Likes {
        liked: false,
        count: 13
      }
    );

    cache.rollback_mutation(
      handle,
      &MutationError::Server {
        status: 500,
        message: String::new(),
      },
    );

    // The failed like is gone but the pushed change survives
    assert_eq!(
      cache.get::<Likes>(&key()).unwrap().as_deref(),
      Some(&Likes {
        liked: false,
        count: 13
      })
    );
    assert_eq!(stored(&path), *cache.get::<Likes>(&key()).unwrap().unwrap());
  }

  #[test]
  fn test_commit_with_reconcile_persists_confirmed_base() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = QueryCache::new().with_storage(SqliteStorage::open(&path).unwrap());
    cache.set(&key(), unliked());

    let other = cache.begin_mutation(&key(), toggle).unwrap();
    let handle = cache.begin_mutation(&key(), bump).unwrap();

    // The echo only knows the counter
    let visible = cache
      .commit_mutation_with(handle, |likes: &Likes| Likes {
        count: 20,
        ..likes.clone()
      })
      .unwrap();

    // The reconciled view still carries the other pending toggle
    assert_eq!(
      *visible,
      Likes {
        liked: true,
        count: 20
      }
    );
    assert_eq!(
      stored(&path),
      Likes {
        liked: false,
        count: 20
      }
    );

    cache.revert_mutation(other);
    assert!(!cache.get::<Likes>(&key()).unwrap().unwrap().liked);
  }

  #[test]
  fn test_invalidate_by_resource_and_prefix() {
    let cache = QueryCache::new();
    let other = CacheKey::of::<Likes>("c2");
    let title = CacheKey::of::<Title>("t1");
    cache.set(&key(), unliked());
    cache.set(&other, unliked());
    cache.set(&title, Title("hello".to_string()));

    assert_eq!(cache.invalidate(KeyPattern::Resource("commentLikes")), 2);
    assert!(cache.is_stale(&key()));
    assert!(cache.is_stale(&other));
    assert!(!cache.is_stale(&title));

    assert_eq!(cache.invalidate(KeyPattern::Prefix("tit".to_string())), 1);
    assert!(cache.is_stale(&title));
    assert_eq!(cache.invalidate(KeyPattern::Prefix("posts".to_string())), 0);
  }

  #[tokio::test]
  async fn test_mutate_reports_type_mismatch() {
    let (notifier, mut tray) = notice::channel(Duration::minutes(1));
    let cache = QueryCache::new().with_notifier(notifier);
    cache.set(&key(), Title("not likes".to_string()));

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let err = cache
      .mutate(&key(), toggle, &[], async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
      })
      .await
      .unwrap_err();

    assert!(matches!(err, MutationError::Cache(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    tray.poll();
    assert_eq!(tray.active().len(), 1);
  }

  #[test]
  fn test_subscribers_see_each_transition() {
    let cache = QueryCache::new();
    let mut sub = cache.subscribe(&key());

    cache.set(&key(), unliked());
    let handle = cache.begin_mutation(&key(), toggle).unwrap();
    cache.rollback_mutation(handle, &MutationError::Network("down".to_string()));
    cache.invalidate(&key());
    cache.evict(&key());

    let changes: Vec<Change> = std::iter::from_fn(|| sub.try_next())
      .map(|e| e.change)
      .collect();
    assert_eq!(
      changes,
      vec![
        Change::Updated,
        Change::Optimistic,
        Change::RolledBack,
        Change::Invalidated,
        Change::Evicted,
      ]
    );
  }

  #[test]
  fn test_release_with_zero_gc_evicts() {
    let cache = QueryCache::new().with_gc_time(Duration::zero());
    cache.set(&key(), unliked());

    cache.retain(&key());
    cache.retain(&key());
    cache.release(&key());
    assert!(cache.contains(&key()));

    cache.release(&key());
    assert!(!cache.contains(&key()));
  }

  #[test]
  fn test_collect_garbage_skips_observed_keys() {
    let cache = QueryCache::new().with_gc_time(Duration::zero());
    let watched = CacheKey::of::<Likes>("watched");
    cache.set(&key(), unliked());
    cache.set(&watched, unliked());
    cache.retain(&watched);

    assert_eq!(cache.collect_garbage(), 1);
    assert!(cache.contains(&watched));
    assert!(!cache.contains(&key()));
  }

  #[test]
  fn test_apply_server_update() {
    let cache = QueryCache::new();
    assert!(!cache.apply_server_update::<Likes, _>(&key(), toggle).unwrap());

    cache.set(&key(), unliked());
    assert!(cache.apply_server_update::<Likes, _>(&key(), toggle).unwrap());
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
  }

  #[tokio::test]
  async fn test_mutate_round_trip() {
    let cache = QueryCache::new();
    cache.set(&key(), unliked());

    let result = cache
      .mutate(&key(), toggle, &[], async { Ok(None) })
      .await
      .unwrap();
    assert_eq!(result.as_deref(), Some(&liked()));

    let err = cache
      .mutate(&key(), toggle, &[], async {
        Err::<Option<Likes>, _>(MutationError::Network("down".to_string()))
      })
      .await
      .unwrap_err();
    assert!(matches!(err, MutationError::Network(_)));
    assert_eq!(cache.get::<Likes>(&key()).unwrap().as_deref(), Some(&liked()));
  }
}
