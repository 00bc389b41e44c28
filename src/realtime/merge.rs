//! Folding push events into the cache.

use tracing::{debug, warn};

use crate::api::{updates, CommentList, NotificationList, VibelyKey};
use crate::cache::{CacheKey, QueryCache};
use crate::error::CacheError;

use super::events::PushEvent;

/// What a push event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
  /// A cached value was updated in place
  Merged,
  /// This many cached keys were marked stale
  Invalidated(usize),
  /// Nothing relevant is cached, or the event is unknown
  Ignored,
  /// The server rejected our session
  AuthFailed,
}

/// Apply one push event.
///
/// Events carrying the full new item are merged in place; counters are
/// not trusted and only invalidate, so the next read refetches them.
pub fn apply_push_event(cache: &QueryCache, event: &PushEvent) -> MergeOutcome {
  let outcome = match event {
    PushEvent::PostLiked { post_id, .. } => invalidate_all(
      cache,
      [
        VibelyKey::post(post_id.as_str()).cache_key(),
        VibelyKey::post_reactions(post_id.as_str()).cache_key(),
        VibelyKey::Feed.cache_key(),
      ],
    ),
    PushEvent::CommentLiked {
      post_id,
      comment_id,
      ..
    } => invalidate_all(
      cache,
      [
        VibelyKey::comments(post_id.as_str()).cache_key(),
        VibelyKey::comment_likes(comment_id.as_str()).cache_key(),
      ],
    ),
    PushEvent::CommentAdded { comment } => {
      let key = VibelyKey::comments(comment.post_id.as_str()).cache_key();
      let merged = cache.apply_server_update(&key, |list: &CommentList| {
        updates::append_comment(list, comment.clone())
      });
      // The post's comment counter moved too
      cache.invalidate(VibelyKey::post(comment.post_id.as_str()).cache_key());
      merged_or_ignored(&key, merged)
    }
    PushEvent::Notification { notification } => {
      let key = VibelyKey::Notifications.cache_key();
      let merged = cache.apply_server_update(&key, |list: &NotificationList| {
        updates::prepend_notification(list, notification.clone())
      });
      merged_or_ignored(&key, merged)
    }
    PushEvent::AuthError { message } => {
      warn!("Realtime session rejected: {}", message);
      MergeOutcome::AuthFailed
    }
    PushEvent::Other => MergeOutcome::Ignored,
  };

  debug!("Push event {} -> {:?}", event.kind(), outcome);
  outcome
}

fn invalidate_all<const N: usize>(cache: &QueryCache, keys: [CacheKey; N]) -> MergeOutcome {
  let count: usize = keys.into_iter().map(|key| cache.invalidate(key)).sum();
  if count == 0 {
    MergeOutcome::Ignored
  } else {
    MergeOutcome::Invalidated(count)
  }
}

fn merged_or_ignored(key: &CacheKey, result: Result<bool, CacheError>) -> MergeOutcome {
  match result {
    Ok(true) => MergeOutcome::Merged,
    Ok(false) => MergeOutcome::Ignored,
    Err(e) => {
      warn!("Could not merge push event into {}: {}", key, e);
      MergeOutcome::Ignored
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::updates::fixtures::{comment, notification, post};
  use crate::api::{CommentLikes, Post};

  #[test]
  fn test_notification_is_prepended_when_cached() {
    let cache = QueryCache::new();
    let event = PushEvent::Notification {
      notification: notification("n2"),
    };

    // Not cached: nothing to merge into
    assert_eq!(apply_push_event(&cache, &event), MergeOutcome::Ignored);
    assert!(!cache.contains(&VibelyKey::Notifications.cache_key()));

    let key = VibelyKey::Notifications.cache_key();
    cache.set(&key, NotificationList(vec![notification("n1")]));
    assert_eq!(apply_push_event(&cache, &event), MergeOutcome::Merged);

    let list = cache.get::<NotificationList>(&key).unwrap().unwrap();
    let ids: Vec<&str> = list.0.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["n2", "n1"]);

    // Redelivery is harmless
    apply_push_event(&cache, &event);
    assert_eq!(cache.get::<NotificationList>(&key).unwrap().unwrap().0.len(), 2);
  }

  #[test]
  fn test_comment_added_appends_once() {
    let cache = QueryCache::new();
    let key = VibelyKey::comments("p1").cache_key();
    cache.set(&key, CommentList(vec![comment("c1", 0, false)]));
    cache.set(&VibelyKey::post("p1").cache_key(), post("p1"));

    let event = PushEvent::CommentAdded {
      comment: comment("c2", 0, false),
    };
    assert_eq!(apply_push_event(&cache, &event), MergeOutcome::Merged);
    assert_eq!(apply_push_event(&cache, &event), MergeOutcome::Merged);

    let list = cache.get::<CommentList>(&key).unwrap().unwrap();
    assert_eq!(list.0.len(), 2);
    assert!(cache.is_stale(&VibelyKey::post("p1").cache_key()));
    assert!(!cache.is_stale(&key));
  }

  #[test]
  fn test_like_events_invalidate() {
    let cache = QueryCache::new();
    cache.set(&VibelyKey::post("p1").cache_key(), post("p1"));
    cache.set(
      &VibelyKey::comment_likes("c1").cache_key(),
      CommentLikes::default(),
    );

    let outcome = apply_push_event(
      &cache,
      &PushEvent::PostLiked {
        post_id: "p1".to_string(),
        like_count: Some(9),
      },
    );
    assert_eq!(outcome, MergeOutcome::Invalidated(1));
    assert!(cache.is_stale(&VibelyKey::post("p1").cache_key()));
    // Value is kept until the refetch lands
    let post = cache.get::<Post>(&VibelyKey::post("p1").cache_key()).unwrap().unwrap();
    assert_eq!(post.like_count, 3);

    let outcome = apply_push_event(
      &cache,
      &PushEvent::CommentLiked {
        post_id: "p1".to_string(),
        comment_id: "c1".to_string(),
        like_count: None,
      },
    );
    assert_eq!(outcome, MergeOutcome::Invalidated(1));
  }

  #[test]
  fn test_auth_and_unknown_events() {
    let cache = QueryCache::new();
    assert_eq!(
      apply_push_event(
        &cache,
        &PushEvent::AuthError {
          message: String::new()
        }
      ),
      MergeOutcome::AuthFailed
    );
    assert_eq!(apply_push_event(&cache, &PushEvent::Other), MergeOutcome::Ignored);
  }
}
