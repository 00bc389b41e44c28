//! Vibely resources as the REST API returns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub display_name: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
}

impl UserSummary {
  pub fn label(&self) -> &str {
    self.display_name.as_deref().unwrap_or(&self.username)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
  Image,
  Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
  pub url: String,
  pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
  pub id: String,
  pub author: UserSummary,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub media: Vec<MediaItem>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub like_count: u32,
  #[serde(default)]
  pub liked_by_me: bool,
  #[serde(default)]
  pub comment_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
  pub id: String,
  pub post_id: String,
  pub author: UserSummary,
  pub content: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub like_count: u32,
  #[serde(default)]
  pub liked_by_me: bool,
  /// Created locally and not yet confirmed by the server
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub pending: bool,
}

/// Comments under one post, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentList(pub Vec<Comment>);

impl CommentList {
  pub fn find(&self, comment_id: &str) -> Option<&Comment> {
    self.0.iter().find(|c| c.id == comment_id)
  }
}

/// Like state of a single comment from the viewer's perspective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentLikes {
  pub liked: bool,
  pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostReactions {
  pub liked_by_me: bool,
  pub count: u32,
  /// Most recent likers, newest first
  #[serde(default)]
  pub recent: Vec<UserSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
  PostLiked,
  CommentLiked,
  Comment,
  FriendRequest,
  FriendAccepted,
  EventInvite,
  Message,
  #[serde(other)]
  Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id: String,
  pub kind: NotificationKind,
  #[serde(default)]
  pub actor: Option<UserSummary>,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub post_id: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub read: bool,
}

/// The viewer's notifications, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationList(pub Vec<Notification>);

impl NotificationList {
  pub fn unread(&self) -> usize {
    self.0.iter().filter(|n| !n.read).count()
  }
}

/// The viewer's home feed, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feed(pub Vec<Post>);
