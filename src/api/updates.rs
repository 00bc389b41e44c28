//! Pure `old -> new` state updates applied optimistically or on push events.
//!
//! None of these touch the cache or the network.

use chrono::{DateTime, Utc};

use super::types::{
  Comment, CommentLikes, CommentList, Notification, NotificationList, Post, PostReactions,
};

/// Flip a like flag and move the counter with it.
fn toggle_count(liked: bool, count: u32) -> (bool, u32) {
  if liked {
    (false, count.saturating_sub(1))
  } else {
    (true, count.saturating_add(1))
  }
}

pub fn toggle_comment_likes(likes: &CommentLikes) -> CommentLikes {
  let (liked, count) = toggle_count(likes.liked, likes.count);
  CommentLikes { liked, count }
}

/// Toggle the viewer's like on one comment inside a list.
pub fn toggle_comment_like_in_list(list: &CommentList, comment_id: &str) -> CommentList {
  map_comment(list, comment_id, |comment| {
    let (liked, count) = toggle_count(comment.liked_by_me, comment.like_count);
    comment.liked_by_me = liked;
    comment.like_count = count;
  })
}

/// Copy confirmed like state into the matching comment.
pub fn apply_comment_likes(list: &CommentList, comment_id: &str, likes: &CommentLikes) -> CommentList {
  map_comment(list, comment_id, |comment| {
    comment.liked_by_me = likes.liked;
    comment.like_count = likes.count;
  })
}

pub fn toggle_post_reactions(reactions: &PostReactions) -> PostReactions {
  let (liked_by_me, count) = toggle_count(reactions.liked_by_me, reactions.count);
  PostReactions {
    liked_by_me,
    count,
    recent: reactions.recent.clone(),
  }
}

/// Take the counters from a server echo; keep the cached liker list when the
/// echo carries none.
pub fn merge_post_reactions(current: &PostReactions, echo: &PostReactions) -> PostReactions {
  PostReactions {
    liked_by_me: echo.liked_by_me,
    count: echo.count,
    recent: if echo.recent.is_empty() {
      current.recent.clone()
    } else {
      echo.recent.clone()
    },
  }
}

pub fn toggle_post_like(post: &Post) -> Post {
  let (liked_by_me, like_count) = toggle_count(post.liked_by_me, post.like_count);
  Post {
    liked_by_me,
    like_count,
    ..post.clone()
  }
}

pub fn apply_post_reactions(post: &Post, reactions: &PostReactions) -> Post {
  Post {
    liked_by_me: reactions.liked_by_me,
    like_count: reactions.count,
    ..post.clone()
  }
}

pub fn adjust_comment_count(post: &Post, delta: i32) -> Post {
  Post {
    comment_count: post.comment_count.saturating_add_signed(delta),
    ..post.clone()
  }
}

/// Append a comment unless one with the same id is already present.
pub fn append_comment(list: &CommentList, comment: Comment) -> CommentList {
  let mut comments = list.0.clone();
  if !comments.iter().any(|c| c.id == comment.id) {
    comments.push(comment);
  }
  CommentList(comments)
}

/// Swap the comment with id `id` (e.g. a pending placeholder) for `comment`.
///
/// If `id` is gone the comment is appended, so a confirmed comment is never
/// dropped. If `comment` already arrived (over the push channel) the
/// placeholder is just removed.
pub fn replace_comment(list: &CommentList, id: &str, comment: Comment) -> CommentList {
  let mut comments = list.0.clone();
  if comments.iter().any(|c| c.id == comment.id) {
    comments.retain(|c| c.id != id);
    return CommentList(comments);
  }
  match comments.iter().position(|c| c.id == id) {
    Some(index) => comments[index] = comment,
    None => comments.push(comment),
  }
  CommentList(comments)
}

/// Replace a comment with its confirmed version. Absent comments stay absent.
pub fn apply_comment(list: &CommentList, comment: Comment) -> CommentList {
  let id = comment.id.clone();
  map_comment(list, &id, |existing| *existing = comment)
}

pub fn edit_comment(
  list: &CommentList,
  comment_id: &str,
  content: &str,
  at: DateTime<Utc>,
) -> CommentList {
  map_comment(list, comment_id, |comment| {
    comment.content = content.to_string();
    comment.updated_at = Some(at);
  })
}

pub fn remove_comment(list: &CommentList, comment_id: &str) -> CommentList {
  CommentList(
    list
      .0
      .iter()
      .filter(|c| c.id != comment_id)
      .cloned()
      .collect(),
  )
}

pub fn mark_notification_read(list: &NotificationList, notification_id: &str) -> NotificationList {
  NotificationList(
    list
      .0
      .iter()
      .map(|n| {
        if n.id == notification_id {
          Notification {
            read: true,
            ..n.clone()
          }
        } else {
          n.clone()
        }
      })
      .collect(),
  )
}

/// Put a new notification on top; duplicates (same id) are dropped.
pub fn prepend_notification(list: &NotificationList, notification: Notification) -> NotificationList {
  if list.0.iter().any(|n| n.id == notification.id) {
    return list.clone();
  }
  let mut notifications = Vec::with_capacity(list.0.len() + 1);
  notifications.push(notification);
  notifications.extend(list.0.iter().cloned());
  NotificationList(notifications)
}

fn map_comment(list: &CommentList, comment_id: &str, f: impl FnOnce(&mut Comment)) -> CommentList {
  let mut comments = list.0.clone();
  if let Some(comment) = comments.iter_mut().find(|c| c.id == comment_id) {
    f(comment);
  }
  CommentList(comments)
}

#[cfg(test)]
pub(crate) mod fixtures {
  use super::super::types::{Comment, NotificationKind, Post, UserSummary};
  use super::*;

  pub fn user(id: &str) -> UserSummary {
    UserSummary {
      id: id.to_string(),
      username: id.to_string(),
      display_name: None,
      avatar_url: None,
    }
  }

  pub fn comment(id: &str, likes: u32, liked: bool) -> Comment {
    Comment {
      id: id.to_string(),
      post_id: "p1".to_string(),
      author: user("ana"),
      content: format!("comment {}", id),
      created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
      updated_at: None,
      like_count: likes,
      liked_by_me: liked,
      pending: false,
    }
  }

  pub fn post(id: &str) -> Post {
    Post {
      id: id.to_string(),
      author: user("ana"),
      content: "hello".to_string(),
      media: Vec::new(),
      created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
      like_count: 3,
      liked_by_me: false,
      comment_count: 2,
    }
  }

  pub fn notification(id: &str) -> Notification {
    Notification {
      id: id.to_string(),
      kind: NotificationKind::PostLiked,
      actor: Some(user("ben")),
      message: "ben liked your post".to_string(),
      post_id: Some("p1".to_string()),
      created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
      read: false,
    }
  }
}
