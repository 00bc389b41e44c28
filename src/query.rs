//! Async query abstraction bound to the shared cache.
//!
//! Inspired by TanStack Query, a `Query<T>` observes one cache key. It loads
//! through [`QueryCache::fetch`] in the background and picks up every later
//! change to the key (optimistic mutations, rollbacks, push merges) on `poll`.
//!
//! # Example
//!
//! ```ignore
//! let client = cached_client.client().clone();
//! let mut query = Query::new(cache.clone(), VibelyKey::comments("p1").cache_key(), move || {
//!     let client = client.clone();
//!     async move { client.get_comments("p1").await.map_err(|e| e.to_string()) }
//! });
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{CacheKey, CacheResult, CacheSource, Cacheable, Change, QueryCache, Subscription};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query has data
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, String>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type FetchResult<T> = Result<CacheResult<Arc<T>>, String>;

/// Observer of one cache key.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure), routed through the cache
/// - Loading/success/error states
/// - Async result handling via channels
/// - Cache change notifications for its key
///
/// The key is retained while the query lives; dropping the query releases it
/// so the cache can garbage-collect the entry.
pub struct Query<T: Cacheable> {
  cache: QueryCache,
  key: CacheKey,
  state: QueryState<Arc<T>>,
  source: Option<CacheSource>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<FetchResult<T>>>,
  subscription: Subscription,
}

impl<T: Cacheable> Query<T> {
  /// Create a query for `key`. Data already cached is available right away.
  ///
  /// The fetcher is a closure that returns a future. It is called whenever
  /// the cache needs the value from the server.
  pub fn new<F, Fut>(cache: QueryCache, key: CacheKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    cache.retain(&key);
    let subscription = cache.subscribe(&key);
    let state = match cache.get::<T>(&key) {
      Ok(Some(value)) => QueryState::Success(value),
      _ => QueryState::Idle,
    };

    Self {
      cache,
      key,
      state,
      source: None,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      subscription,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<Arc<T>> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data().map(|data| data.as_ref())
  }

  /// Where the last fetched value came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check whether the cached value is stale or missing.
  pub fn is_stale(&self) -> bool {
    self.cache.is_stale(&self.key)
  }

  /// Start fetching data if not already loading.
  ///
  /// A fresh cached value is served without touching the network.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start_fetch();
  }

  /// Mark the key stale and fetch again, replacing any pending fetch.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.cache.invalidate(self.key.clone());
    self.start_fetch();
  }

  /// Poll for fetch results and cache changes.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_fetch();

    while let Some(event) = self.subscription.try_next() {
      changed |= match event.change {
        Change::Invalidated => {
          // Observed keys refetch as soon as they go stale
          if self.receiver.is_none() {
            debug!("{} invalidated, refetching", self.key);
            self.start_fetch();
          }
          false
        }
        Change::Evicted => {
          let had_data = self.state.is_success();
          if had_data {
            self.state = QueryState::Idle;
          }
          had_data
        }
        _ => self.reload(),
      };
    }

    changed
  }

  fn poll_fetch(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(result)) => {
        self.source = Some(result.source);
        self.state = QueryState::Success(result.data);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  /// Re-read the key after a change notification.
  fn reload(&mut self) -> bool {
    let Ok(Some(value)) = self.cache.get::<T>(&self.key) else {
      return false;
    };
    if let QueryState::Success(current) = &self.state {
      if Arc::ptr_eq(current, &value) {
        return false;
      }
    }
    // A pending fetch still counts as loading; its result lands later
    if self.receiver.is_none() || self.state.is_success() {
      self.state = QueryState::Success(value);
      return true;
    }
    false
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if !self.state.is_success() {
      self.state = QueryState::Loading;
    }

    let cache = self.cache.clone();
    let key = self.key.clone();
    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = cache.fetch(&key, move || future).await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: Cacheable> Drop for Query<T> {
  fn drop(&mut self) {
    self.cache.release(&self.key);
  }
}

impl<T: Cacheable + std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("source", &self.source)
      .finish_non_exhaustive()
  }
}
