//! Vibely API: wire types, REST client and the cached client built on it.

mod cached_client;
mod client;
mod keys;
mod transport;
mod types;
pub mod updates;

pub use cached_client::{validate_comment, CachedVibelyClient, MAX_COMMENT_LEN};
pub use client::{decode, echo, VibelyClient};
pub use keys::VibelyKey;
pub use transport::{HttpTransport, Transport};
pub use types::{
  Comment, CommentLikes, CommentList, Feed, MediaItem, MediaKind, Notification, NotificationKind,
  NotificationList, Post, PostReactions, UserSummary,
};
