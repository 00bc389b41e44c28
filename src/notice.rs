//! Transient, dismissible messages shown to the user (the toast tray).

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
  Info,
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub id: u64,
  pub level: NoticeLevel,
  pub message: String,
  pub created_at: DateTime<Utc>,
}

/// Sending half. Cheap to clone; sends are dropped if the tray is gone.
#[derive(Clone)]
pub struct Notifier {
  tx: mpsc::UnboundedSender<Notice>,
  next_id: Arc<AtomicU64>,
}

impl Notifier {
  pub fn push(&self, level: NoticeLevel, message: impl Into<String>) -> Notice {
    let notice = Notice {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      level,
      message: message.into(),
      created_at: Utc::now(),
    };
    // Ignore send errors - tray may have been dropped
    let _ = self.tx.send(notice.clone());
    notice
  }

  pub fn error(&self, message: impl Into<String>) -> Notice {
    self.push(NoticeLevel::Error, message)
  }

  pub fn info(&self, message: impl Into<String>) -> Notice {
    self.push(NoticeLevel::Info, message)
  }

  pub fn success(&self, message: impl Into<String>) -> Notice {
    self.push(NoticeLevel::Success, message)
  }
}

/// Receiving half: holds the notices currently on screen.
pub struct NoticeTray {
  rx: mpsc::UnboundedReceiver<Notice>,
  active: Vec<Notice>,
  ttl: Duration,
}

/// Create a connected notifier/tray pair. Notices expire after `ttl`.
pub fn channel(ttl: Duration) -> (Notifier, NoticeTray) {
  let (tx, rx) = mpsc::unbounded_channel();
  let notifier = Notifier {
    tx,
    next_id: Arc::new(AtomicU64::new(1)),
  };
  let tray = NoticeTray {
    rx,
    active: Vec::new(),
    ttl,
  };
  (notifier, tray)
}

impl NoticeTray {
  /// Drain new notices and drop expired ones.
  ///
  /// Returns `true` if the visible set changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    while let Ok(notice) = self.rx.try_recv() {
      self.active.push(notice);
      changed = true;
    }

    let now = Utc::now();
    let before = self.active.len();
    let ttl = self.ttl;
    self.active.retain(|n| now - n.created_at < ttl);

    changed || self.active.len() != before
  }

  pub fn active(&self) -> &[Notice] {
    &self.active
  }

  pub fn dismiss(&mut self, id: u64) -> bool {
    let before = self.active.len();
    self.active.retain(|n| n.id != id);
    self.active.len() != before
  }
}
