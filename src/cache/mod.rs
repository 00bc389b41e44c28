//! Client-side cache of server-derived view state.
//!
//! This module provides an application-agnostic cache that:
//! - Holds one authoritative snapshot per key (resource type + owning id)
//! - Applies optimistic mutations immediately and reconciles them with the
//!   server's answer, or restores the pre-mutation snapshot on failure
//! - Marks keys stale on invalidation so the next read refetches
//! - Evicts entries nobody observes once their GC time elapses
//! - Optionally persists confirmed snapshots for offline reads

mod layer;
mod mutation;
mod storage;
mod traits;

pub use layer::{CacheEvent, Change, QueryCache, Subscription};
pub use mutation::MutationHandle;
pub use storage::{NoopStorage, SnapshotStorage, SqliteStorage, StoredSnapshot};
pub use traits::{CacheKey, CacheResult, CacheSource, Cacheable, KeyPattern};
