//! Cached Vibely client: read-through fetches and optimistic writes.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheKey, CacheResult, Cacheable, QueryCache};
use crate::error::{ApiError, MutationError};

use super::client::{echo, VibelyClient};
use super::keys::VibelyKey;
use super::types::{
  Comment, CommentLikes, CommentList, NotificationList, Post, PostReactions, UserSummary,
};
use super::updates;

/// Longest comment the server accepts, in characters.
pub const MAX_COMMENT_LEN: usize = 2000;

/// Vibely client with transparent caching and optimistic mutations.
///
/// This wraps the underlying VibelyClient and a shared QueryCache. Reads go
/// through the cache; writes update the cache before the request is sent and
/// reconcile or roll back when it settles.
#[derive(Clone)]
pub struct CachedVibelyClient {
  inner: VibelyClient,
  cache: QueryCache,
  /// Author shown on comments created before the server confirms them
  viewer: Option<UserSummary>,
  next_temp_id: Arc<AtomicU64>,
}

impl CachedVibelyClient {
  pub fn new(inner: VibelyClient, cache: QueryCache) -> Self {
    Self {
      inner,
      cache,
      viewer: None,
      next_temp_id: Arc::new(AtomicU64::new(1)),
    }
  }

  pub fn with_viewer(mut self, viewer: UserSummary) -> Self {
    self.viewer = Some(viewer);
    self
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// The uncached client, for fetchers handed to a [`Query`](crate::query::Query).
  pub fn client(&self) -> &VibelyClient {
    &self.inner
  }

  fn current<T: Cacheable>(&self, key: &CacheKey) -> Option<Arc<T>> {
    self.cache.get::<T>(key).ok().flatten()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn get_post(&self, post_id: &str) -> Result<CacheResult<Arc<Post>>, ApiError> {
    let key = VibelyKey::post(post_id).cache_key();
    self.cache.fetch(&key, || self.inner.get_post(post_id)).await
  }

  pub async fn get_comments(
    &self,
    post_id: &str,
  ) -> Result<CacheResult<Arc<CommentList>>, ApiError> {
    let key = VibelyKey::comments(post_id).cache_key();
    self
      .cache
      .fetch(&key, || self.inner.get_comments(post_id))
      .await
  }

  pub async fn get_comment_likes(
    &self,
    comment_id: &str,
  ) -> Result<CacheResult<Arc<CommentLikes>>, ApiError> {
    let key = VibelyKey::comment_likes(comment_id).cache_key();
    self
      .cache
      .fetch(&key, || self.inner.get_comment_likes(comment_id))
      .await
  }

  pub async fn get_post_reactions(
    &self,
    post_id: &str,
  ) -> Result<CacheResult<Arc<PostReactions>>, ApiError> {
    let key = VibelyKey::post_reactions(post_id).cache_key();
    self
      .cache
      .fetch(&key, || self.inner.get_post_reactions(post_id))
      .await
  }

  pub async fn get_notifications(&self) -> Result<CacheResult<Arc<NotificationList>>, ApiError> {
    let key = VibelyKey::Notifications.cache_key();
    self
      .cache
      .fetch(&key, || self.inner.get_notifications())
      .await
  }

  // ==========================================================================
  // Optimistic writes
  // ==========================================================================

  /// Surface an error raised before any request was sent, then hand it back.
  fn reject(&self, err: impl Into<MutationError>) -> MutationError {
    let err = err.into();
    self.cache.report(&err);
    err
  }

  /// Toggle the viewer's like on a comment.
  ///
  /// Updates both the comment list of the post and the comment's own like
  /// state, and invalidates both once the server confirms. Returns the
  /// server's like state when it echoes one.
  pub async fn toggle_comment_like(
    &self,
    post_id: &str,
    comment_id: &str,
  ) -> Result<Option<CommentLikes>, MutationError> {
    let list_key = VibelyKey::comments(post_id).cache_key();
    let likes_key = VibelyKey::comment_likes(comment_id).cache_key();

    let list = self
      .cache
      .begin_mutation(&list_key, |list: &CommentList| {
        updates::toggle_comment_like_in_list(list, comment_id)
      })
      .map_err(|e| self.reject(e))?
      .invalidates(list_key.clone())
      .invalidates(likes_key.clone());

    let likes = match self
      .cache
      .begin_mutation(&likes_key, updates::toggle_comment_likes)
    {
      Ok(handle) => handle
        .invalidates(list_key.clone())
        .invalidates(likes_key.clone()),
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.rollback_mutation(list, &err);
        return Err(err);
      }
    };

    match self.inner.toggle_comment_like(comment_id).await {
      Ok(body) => {
        let confirmed: Option<CommentLikes> = echo(body);
        self.cache.commit_mutation(likes, confirmed);
        match confirmed {
          Some(likes) => {
            self.cache.commit_mutation_with(list, |list: &CommentList| {
              updates::apply_comment_likes(list, comment_id, &likes)
            });
          }
          None => {
            self.cache.commit_mutation(list, None);
          }
        }

        info!("Toggled like on comment {}", comment_id);
        Ok(confirmed)
      }
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.revert_mutation(likes);
        self.cache.rollback_mutation(list, &err);
        Err(err)
      }
    }
  }

  /// Toggle the viewer's like on a post.
  pub async fn toggle_post_like(
    &self,
    post_id: &str,
  ) -> Result<Option<PostReactions>, MutationError> {
    let reactions_key = VibelyKey::post_reactions(post_id).cache_key();
    let post_key = VibelyKey::post(post_id).cache_key();
    let feed_key = VibelyKey::Feed.cache_key();

    let reactions = self
      .cache
      .begin_mutation(&reactions_key, updates::toggle_post_reactions)
      .map_err(|e| self.reject(e))?
      .invalidates(reactions_key.clone())
      .invalidates(post_key.clone())
      .invalidates(feed_key);

    let post = match self.cache.begin_mutation(&post_key, updates::toggle_post_like) {
      Ok(handle) => handle,
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.rollback_mutation(reactions, &err);
        return Err(err);
      }
    };

    match self.inner.toggle_post_like(post_id).await {
      Ok(body) => {
        let confirmed: Option<PostReactions> = echo(body);
        match &confirmed {
          Some(echo) => {
            self.cache.commit_mutation_with(post, |post: &Post| {
              updates::apply_post_reactions(post, echo)
            });
            self
              .cache
              .commit_mutation_with(reactions, |current: &PostReactions| {
                updates::merge_post_reactions(current, echo)
              });
          }
          None => {
            self.cache.commit_mutation(post, None);
            self.cache.commit_mutation(reactions, None);
          }
        }

        info!("Toggled like on post {}", post_id);
        Ok(confirmed)
      }
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.revert_mutation(post);
        self.cache.rollback_mutation(reactions, &err);
        Err(err)
      }
    }
  }

  /// Add a comment to a post.
  ///
  /// A pending placeholder is appended right away and swapped for the server's
  /// comment when it arrives. Invalid content fails before anything else runs.
  pub async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment, MutationError> {
    let content = validate_comment(content).map_err(|e| self.reject(e))?;
    let list_key = VibelyKey::comments(post_id).cache_key();
    let post_key = VibelyKey::post(post_id).cache_key();

    let temp_id = format!("temp-{}", self.next_temp_id.fetch_add(1, Ordering::Relaxed));
    let placeholder = Comment {
      id: temp_id.clone(),
      post_id: post_id.to_string(),
      author: self.viewer.clone().unwrap_or_else(unknown_viewer),
      content: content.clone(),
      created_at: Utc::now(),
      updated_at: None,
      like_count: 0,
      liked_by_me: false,
      pending: true,
    };

    let list = self
      .cache
      .begin_mutation(&list_key, |list: &CommentList| {
        updates::append_comment(list, placeholder.clone())
      })
      .map_err(|e| self.reject(e))?;

    let post = match self
      .cache
      .begin_mutation(&post_key, |post: &Post| updates::adjust_comment_count(post, 1))
    {
      Ok(handle) => handle,
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.rollback_mutation(list, &err);
        return Err(err);
      }
    };

    match self.inner.create_comment(post_id, &content).await {
      Ok(body) => {
        let created: Option<Comment> = echo(body);
        match &created {
          Some(comment) => {
            self.cache.commit_mutation_with(list, |list: &CommentList| {
              updates::replace_comment(list, &temp_id, comment.clone())
            });
          }
          None => {
            // The placeholder stays until the list is refetched
            self
              .cache
              .commit_mutation(list.invalidates(list_key.clone()), None);
          }
        }
        self.cache.commit_mutation(post, None);

        info!("Added comment to post {}", post_id);
        Ok(created.unwrap_or(placeholder))
      }
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.revert_mutation(post);
        self.cache.rollback_mutation(list, &err);
        Err(err)
      }
    }
  }

  /// Change the text of an existing comment.
  pub async fn edit_comment(
    &self,
    post_id: &str,
    comment_id: &str,
    content: &str,
  ) -> Result<(), MutationError> {
    let content = validate_comment(content).map_err(|e| self.reject(e))?;
    let list_key = VibelyKey::comments(post_id).cache_key();
    let edited_at = Utc::now();

    let list = self
      .cache
      .begin_mutation(&list_key, |list: &CommentList| {
        updates::edit_comment(list, comment_id, &content, edited_at)
      })
      .map_err(|e| self.reject(e))?;

    match self.inner.update_comment(comment_id, &content).await {
      Ok(body) => {
        match echo::<Comment>(body) {
          Some(comment) => {
            self.cache.commit_mutation_with(list, |list: &CommentList| {
              updates::apply_comment(list, comment.clone())
            });
          }
          None => {
            self.cache.commit_mutation(list, None);
          }
        }

        info!("Edited comment {}", comment_id);
        Ok(())
      }
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.rollback_mutation(list, &err);
        Err(err)
      }
    }
  }

  /// Delete a comment. Its like state is dropped from the cache on success.
  pub async fn delete_comment(&self, post_id: &str, comment_id: &str) -> Result<(), MutationError> {
    let list_key = VibelyKey::comments(post_id).cache_key();
    let post_key = VibelyKey::post(post_id).cache_key();

    let list = self
      .cache
      .begin_mutation(&list_key, |list: &CommentList| {
        updates::remove_comment(list, comment_id)
      })
      .map_err(|e| self.reject(e))?;

    let post = match self
      .cache
      .begin_mutation(&post_key, |post: &Post| updates::adjust_comment_count(post, -1))
    {
      Ok(handle) => handle,
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.rollback_mutation(list, &err);
        return Err(err);
      }
    };

    match self.inner.delete_comment(comment_id).await {
      Ok(_) => {
        self.cache.commit_mutation(list, None);
        self.cache.commit_mutation(post, None);
        self
          .cache
          .forget(&VibelyKey::comment_likes(comment_id).cache_key());

        info!("Deleted comment {}", comment_id);
        Ok(())
      }
      Err(e) => {
        let err = MutationError::from(e);
        self.cache.revert_mutation(post);
        self.cache.rollback_mutation(list, &err);
        Err(err)
      }
    }
  }

  /// Mark one notification as read.
  pub async fn mark_notification_read(&self, notification_id: &str) -> Result<(), MutationError> {
    let key = VibelyKey::Notifications.cache_key();
    let request = async {
      self.inner.mark_notification_read(notification_id).await?;
      Ok::<Option<NotificationList>, MutationError>(None)
    };

    self
      .cache
      .mutate(
        &key,
        |list: &NotificationList| updates::mark_notification_read(list, notification_id),
        &[],
        request,
      )
      .await?;
    Ok(())
  }
}

/// Trim and check comment text before anything is sent or cached.
pub fn validate_comment(content: &str) -> Result<String, MutationError> {
  let content = content.trim();
  if content.is_empty() {
    return Err(MutationError::Validation(
      "Comment cannot be empty".to_string(),
    ));
  }
  if content.chars().count() > MAX_COMMENT_LEN {
    return Err(MutationError::Validation(format!(
      "Comment is too long (max {} characters)",
      MAX_COMMENT_LEN
    )));
  }
  Ok(content.to_string())
}

fn unknown_viewer() -> UserSummary {
  UserSummary {
    id: String::new(),
    username: "you".to_string(),
    display_name: None,
    avatar_url: None,
  }
}
