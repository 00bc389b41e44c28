use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::error::ApiError;

use super::transport::Transport;
use super::types::{CommentLikes, CommentList, NotificationList, Post, PostReactions};

/// Vibely REST API client
#[derive(Clone)]
pub struct VibelyClient {
  transport: Arc<dyn Transport>,
}

impl VibelyClient {
  pub fn new(transport: impl Transport + 'static) -> Self {
    Self {
      transport: Arc::new(transport),
    }
  }

  pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    let body = self.transport.request(Method::GET, path, None).await?;
    decode(body)
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn get_post(&self, post_id: &str) -> Result<Post, ApiError> {
    self.get(&path(&["posts", post_id])?).await
  }

  pub async fn get_comments(&self, post_id: &str) -> Result<CommentList, ApiError> {
    self.get(&path(&["posts", post_id, "comments"])?).await
  }

  pub async fn get_comment_likes(&self, comment_id: &str) -> Result<CommentLikes, ApiError> {
    self.get(&path(&["comments", comment_id, "likes"])?).await
  }

  pub async fn get_post_reactions(&self, post_id: &str) -> Result<PostReactions, ApiError> {
    self.get(&path(&["posts", post_id, "reactions"])?).await
  }

  pub async fn get_notifications(&self) -> Result<NotificationList, ApiError> {
    self.get("/notifications").await
  }

  // ==========================================================================
  // Writes - these return the raw echo; callers decide what it means
  // ==========================================================================

  /// Toggle the viewer's like on a comment.
  pub async fn toggle_comment_like(&self, comment_id: &str) -> Result<Value, ApiError> {
    let path = path(&["comments", comment_id, "like"])?;
    self.transport.request(Method::POST, &path, None).await
  }

  /// Toggle the viewer's like on a post.
  pub async fn toggle_post_like(&self, post_id: &str) -> Result<Value, ApiError> {
    let path = path(&["posts", post_id, "like"])?;
    self.transport.request(Method::POST, &path, None).await
  }

  pub async fn create_comment(&self, post_id: &str, content: &str) -> Result<Value, ApiError> {
    let path = path(&["posts", post_id, "comments"])?;
    let body = json!({ "content": content });
    self.transport.request(Method::POST, &path, Some(body)).await
  }

  pub async fn update_comment(&self, comment_id: &str, content: &str) -> Result<Value, ApiError> {
    let path = path(&["comments", comment_id])?;
    let body = json!({ "content": content });
    self.transport.request(Method::PATCH, &path, Some(body)).await
  }

  pub async fn delete_comment(&self, comment_id: &str) -> Result<Value, ApiError> {
    let path = path(&["comments", comment_id])?;
    self.transport.request(Method::DELETE, &path, None).await
  }

  pub async fn mark_notification_read(&self, notification_id: &str) -> Result<Value, ApiError> {
    let path = path(&["notifications", notification_id, "read"])?;
    self.transport.request(Method::POST, &path, None).await
  }
}

/// Build a request path from raw segments, percent-encoding each one so an id
/// can never add segments or a query string.
fn path(segments: &[&str]) -> Result<String, ApiError> {
  // URL parsing folds these away even when encoded
  if let Some(bad) = segments
    .iter()
    .find(|s| s.is_empty() || **s == "." || **s == "..")
  {
    return Err(ApiError::InvalidId(bad.to_string()));
  }

  let mut url =
    Url::parse("http://localhost/").map_err(|e| ApiError::Network(e.to_string()))?;
  url
    .path_segments_mut()
    .map_err(|_| ApiError::Network("cannot build request path".to_string()))?
    .clear()
    .extend(segments);
  Ok(url.path().to_string())
}

/// Decode a response body, accepting a `{ "data": ... }` envelope.
pub fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
  match serde_json::from_value::<T>(body.clone()) {
    Ok(value) => Ok(value),
    Err(err) => match body {
      Value::Object(mut obj) if obj.contains_key("data") => {
        serde_json::from_value(obj.remove("data").unwrap_or(Value::Null))
          .map_err(|e| ApiError::Decode(e.to_string()))
      }
      _ => Err(ApiError::Decode(err.to_string())),
    },
  }
}

/// Read a mutation echo if it has the expected shape.
///
/// A 2xx answer is a success whatever its body says; an unexpected body only
/// means there is no echo to reconcile with.
pub fn echo<T: DeserializeOwned>(body: Value) -> Option<T> {
  if body.is_null() {
    return None;
  }
  match decode(body) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!("Ignoring unexpected mutation response: {}", e);
      None
    }
  }
}
