//! Realtime push channel.
//!
//! The server pushes JSON events over a WebSocket. Each event is merged into
//! the [`QueryCache`](crate::cache::QueryCache) as it arrives: full items are
//! folded in place, counters only invalidate.

mod backoff;
mod channel;
mod events;
mod merge;

pub use backoff::BackoffState;
pub use channel::{ConnectionState, PushChannel, PushUpdate};
pub use events::PushEvent;
pub use merge::{apply_push_event, MergeOutcome};
