//! Push events sent by the server over the realtime channel.

use serde::Deserialize;

use crate::api::{Comment, Notification};

/// One JSON frame from the server, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushEvent {
  /// Someone liked or unliked a post
  #[serde(rename_all = "camelCase")]
  PostLiked {
    post_id: String,
    #[serde(default)]
    like_count: Option<u32>,
  },

  /// A comment was created on a post
  CommentAdded { comment: Comment },

  #[serde(rename_all = "camelCase")]
  CommentLiked {
    post_id: String,
    comment_id: String,
    #[serde(default)]
    like_count: Option<u32>,
  },

  Notification { notification: Notification },

  /// The session token was rejected
  AuthError {
    #[serde(default)]
    message: String,
  },

  /// Anything this client does not know about
  #[serde(other)]
  Other,
}

impl PushEvent {
  pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(text)
  }

  /// Short name for logs.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::PostLiked { .. } => "postLiked",
      Self::CommentAdded { .. } => "commentAdded",
      Self::CommentLiked { .. } => "commentLiked",
      Self::Notification { .. } => "notification",
      Self::AuthError { .. } => "authError",
      Self::Other => "other",
    }
  }
}
