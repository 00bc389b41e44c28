//! Caching implementations for Vibely types.

use crate::cache::{CacheKey, Cacheable};

use super::types::{CommentLikes, CommentList, Feed, NotificationList, Post, PostReactions};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Post {
  fn resource() -> &'static str {
    "post"
  }
}

impl Cacheable for CommentList {
  fn resource() -> &'static str {
    "comments"
  }
}

impl Cacheable for CommentLikes {
  fn resource() -> &'static str {
    "commentLikes"
  }
}

impl Cacheable for PostReactions {
  fn resource() -> &'static str {
    "postReactions"
  }
}

impl Cacheable for NotificationList {
  fn resource() -> &'static str {
    "notifications"
  }
}

impl Cacheable for Feed {
  fn resource() -> &'static str {
    "feed"
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// Id used for resources scoped to the signed-in viewer.
const VIEWER: &str = "me";

/// Every cache slot the client reads or mutates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VibelyKey {
  Post { post_id: String },
  Comments { post_id: String },
  CommentLikes { comment_id: String },
  PostReactions { post_id: String },
  Feed,
  Notifications,
}

impl VibelyKey {
  pub fn post(post_id: impl Into<String>) -> Self {
    Self::Post {
      post_id: post_id.into(),
    }
  }

  pub fn comments(post_id: impl Into<String>) -> Self {
    Self::Comments {
      post_id: post_id.into(),
    }
  }

  pub fn comment_likes(comment_id: impl Into<String>) -> Self {
    Self::CommentLikes {
      comment_id: comment_id.into(),
    }
  }

  pub fn post_reactions(post_id: impl Into<String>) -> Self {
    Self::PostReactions {
      post_id: post_id.into(),
    }
  }

  pub fn cache_key(&self) -> CacheKey {
    match self {
      Self::Post { post_id } => CacheKey::of::<Post>(post_id.as_str()),
      Self::Comments { post_id } => CacheKey::of::<CommentList>(post_id.as_str()),
      Self::CommentLikes { comment_id } => CacheKey::of::<CommentLikes>(comment_id.as_str()),
      Self::PostReactions { post_id } => CacheKey::of::<PostReactions>(post_id.as_str()),
      Self::Feed => CacheKey::of::<Feed>(VIEWER),
      Self::Notifications => CacheKey::of::<NotificationList>(VIEWER),
    }
  }
}

impl From<VibelyKey> for CacheKey {
  fn from(key: VibelyKey) -> Self {
    key.cache_key()
  }
}
