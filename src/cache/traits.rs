//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Trait for server-derived values that can live in the cache.
///
/// Values are stored behind an `Arc` and handed out as immutable snapshots,
/// so implementors only need to be cheap enough to clone when a transform
/// builds the next value.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Resource name used as the first half of a cache key (e.g. "comments").
  fn resource() -> &'static str;
}

/// Composite key scoping a cached entity: resource type + owning id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  resource: &'static str,
  id: String,
}

impl CacheKey {
  pub fn new(resource: &'static str, id: impl Into<String>) -> Self {
    Self {
      resource,
      id: id.into(),
    }
  }

  /// Key for a `Cacheable` type, taking the resource name from the type.
  pub fn of<T: Cacheable>(id: impl Into<String>) -> Self {
    Self::new(T::resource(), id)
  }

  pub fn resource(&self) -> &'static str {
    self.resource
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// SHA256 of the rendered key, for stable fixed-length storage keys.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.resource, self.id)
  }
}

/// Selects one or more keys for invalidation or eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
  /// Exactly one key
  Exact(CacheKey),
  /// Every key of a resource (e.g. all "comments:*")
  Resource(&'static str),
  /// Every key whose rendered form starts with the prefix
  Prefix(String),
}

impl KeyPattern {
  pub fn matches(&self, key: &CacheKey) -> bool {
    match self {
      Self::Exact(k) => k == key,
      Self::Resource(resource) => key.resource() == *resource,
      Self::Prefix(prefix) => key.to_string().starts_with(prefix.as_str()),
    }
  }
}

impl From<CacheKey> for KeyPattern {
  fn from(key: CacheKey) -> Self {
    Self::Exact(key)
  }
}

impl From<&CacheKey> for KeyPattern {
  fn from(key: &CacheKey) -> Self {
    Self::Exact(key.clone())
  }
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Network unavailable, serving the last known-good value
  Offline,
}
