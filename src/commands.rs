//! Command-line subcommands and their output.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::fmt::Write as _;
use tokio::sync::mpsc;

use crate::api::{CachedVibelyClient, Comment, CommentList, Notification, Post, PostReactions};
use crate::cache::{CacheResult, CacheSource};
use crate::config::Config;
use crate::error::MutationError;
use crate::realtime::{MergeOutcome, PushChannel};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Show a post with its reactions
  Post { post_id: String },
  /// List the comments on a post
  Comments { post_id: String },
  /// Like or unlike a comment
  LikeComment { post_id: String, comment_id: String },
  /// Like or unlike a post
  LikePost { post_id: String },
  /// Comment on a post
  Comment { post_id: String, content: String },
  /// Change the text of one of your comments
  EditComment {
    post_id: String,
    comment_id: String,
    content: String,
  },
  /// Delete one of your comments
  DeleteComment { post_id: String, comment_id: String },
  /// List notifications
  Notifications {
    /// Mark this notification as read first
    #[arg(long)]
    read: Option<String>,
  },
  /// Stream realtime events until interrupted
  Watch,
}

/// Run one command, printing its output to stdout.
pub async fn run(command: Command, client: &CachedVibelyClient, config: &Config) -> Result<()> {
  match command {
    Command::Post { post_id } => {
      let post = client.get_post(&post_id).await?;
      print!("{}", source_note(&post));
      print!("{}", format_post(&post.data));
      if let Ok(reactions) = client.get_post_reactions(&post_id).await {
        print!("{}", format_reactions(&reactions.data));
      }
    }
    Command::Comments { post_id } => {
      let comments = client.get_comments(&post_id).await?;
      print!("{}", source_note(&comments));
      print!("{}", format_comments(&comments.data));
    }
    Command::LikeComment {
      post_id,
      comment_id,
    } => {
      // Load the views first so the like has something to update
      client.get_comments(&post_id).await?;
      let _ = client.get_comment_likes(&comment_id).await;
      let likes = client
        .toggle_comment_like(&post_id, &comment_id)
        .await
        .map_err(mutation_failed)?;

      match likes {
        Some(likes) => println!(
          "{} comment {} ({} likes)",
          if likes.liked { "Liked" } else { "Unliked" },
          comment_id,
          likes.count
        ),
        None => println!("Toggled like on comment {}", comment_id),
      }
    }
    Command::LikePost { post_id } => {
      client.get_post(&post_id).await?;
      let _ = client.get_post_reactions(&post_id).await;
      let reactions = client
        .toggle_post_like(&post_id)
        .await
        .map_err(mutation_failed)?;

      match reactions {
        Some(reactions) => print!("{}", format_reactions(&reactions)),
        None => println!("Toggled like on post {}", post_id),
      }
    }
    Command::Comment { post_id, content } => {
      let _ = client.get_comments(&post_id).await;
      let comment = client
        .add_comment(&post_id, &content)
        .await
        .map_err(mutation_failed)?;
      print!("{}", format_comment(&comment));
    }
    Command::EditComment {
      post_id,
      comment_id,
      content,
    } => {
      client.get_comments(&post_id).await?;
      client
        .edit_comment(&post_id, &comment_id, &content)
        .await
        .map_err(mutation_failed)?;
      println!("Updated comment {}", comment_id);
    }
    Command::DeleteComment {
      post_id,
      comment_id,
    } => {
      let _ = client.get_comments(&post_id).await;
      client
        .delete_comment(&post_id, &comment_id)
        .await
        .map_err(mutation_failed)?;
      println!("Deleted comment {}", comment_id);
    }
    Command::Notifications { read } => {
      let mut list = client.get_notifications().await?;
      if let Some(id) = read {
        client
          .mark_notification_read(&id)
          .await
          .map_err(mutation_failed)?;
        list = client.get_notifications().await?;
      }
      print!("{}", source_note(&list));
      for notification in &list.data.0 {
        println!("{}", format_notification(notification));
      }
      println!("{} unread", list.data.unread());
    }
    Command::Watch => watch(client, config).await?,
  }

  Ok(())
}

async fn watch(client: &CachedVibelyClient, config: &Config) -> Result<()> {
  // Merges only land on cached keys
  let _ = client.get_notifications().await;

  let channel = PushChannel::new(config.realtime.clone(), client.cache().clone());
  let mut states = channel.watch_state();
  let (tx, mut rx) = mpsc::unbounded_channel();

  let run = channel.run(tx);
  tokio::pin!(run);

  loop {
    tokio::select! {
      result = &mut run => {
        // Drain what arrived before the channel stopped
        while let Ok(update) = rx.try_recv() {
          println!("{} -> {}", update.event.kind(), outcome_label(update.outcome));
        }
        return result.map_err(|e| eyre!("Realtime channel stopped: {}", e));
      }
      Some(update) = rx.recv() => {
        println!("{} -> {}", update.event.kind(), outcome_label(update.outcome));
      }
      Ok(()) = states.changed() => {
        eprintln!("[{}]", *states.borrow_and_update());
      }
      _ = tokio::signal::ctrl_c() => {
        eprintln!("Stopped");
        return Ok(());
      }
    }
  }
}

/// The friendly text already went to the notice tray.
fn mutation_failed(err: MutationError) -> color_eyre::Report {
  eyre!("Mutation failed: {}", err)
}

fn outcome_label(outcome: MergeOutcome) -> String {
  match outcome {
    MergeOutcome::Merged => "merged".to_string(),
    MergeOutcome::Invalidated(n) => format!("invalidated {} key(s)", n),
    MergeOutcome::Ignored => "ignored".to_string(),
    MergeOutcome::AuthFailed => "auth failed".to_string(),
  }
}

fn source_note<T>(result: &CacheResult<T>) -> String {
  match (result.source, result.cached_at) {
    (CacheSource::Offline, Some(at)) => {
      format!("(offline, showing data from {})\n", at.format("%Y-%m-%d %H:%M"))
    }
    (CacheSource::Offline, None) => "(offline)\n".to_string(),
    _ => String::new(),
  }
}

// ============================================================================
// Formatting
// ============================================================================

pub fn format_post(post: &Post) -> String {
  let mut out = String::new();
  let _ = writeln!(
    out,
    "{} · {}",
    post.author.label(),
    post.created_at.format("%Y-%m-%d %H:%M")
  );
  if !post.content.is_empty() {
    let _ = writeln!(out, "{}", post.content);
  }
  for media in &post.media {
    let _ = writeln!(out, "[{:?}] {}", media.kind, media.url);
  }
  let _ = writeln!(
    out,
    "{} {} · {} comments",
    if post.liked_by_me { "♥" } else { "♡" },
    post.like_count,
    post.comment_count
  );
  out
}

pub fn format_reactions(reactions: &PostReactions) -> String {
  let names: Vec<&str> = reactions.recent.iter().map(|u| u.label()).collect();
  if names.is_empty() {
    format!("{} likes\n", reactions.count)
  } else {
    format!("{} likes, including {}\n", reactions.count, names.join(", "))
  }
}

pub fn format_comment(comment: &Comment) -> String {
  let mut line = format!(
    "[{}] {}: {} ({} likes{})",
    comment.id,
    comment.author.label(),
    comment.content,
    comment.like_count,
    if comment.liked_by_me { ", liked" } else { "" }
  );
  if comment.updated_at.is_some() {
    line.push_str(" (edited)");
  }
  if comment.pending {
    line.push_str(" (sending)");
  }
  line.push('\n');
  line
}

pub fn format_comments(comments: &CommentList) -> String {
  if comments.0.is_empty() {
    return "No comments yet\n".to_string();
  }
  comments.0.iter().map(format_comment).collect()
}

pub fn format_notification(notification: &Notification) -> String {
  format!(
    "{} [{}] {}",
    if notification.read { " " } else { "•" },
    notification.id,
    notification.message
  )
}
