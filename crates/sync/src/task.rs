//! Fetch task queue.
//!
//! Strict priority within an account (recent window beats incremental
//! beats backfill beats attachments), round-robin across accounts so a
//! busy mailbox cannot starve the others. Ties within a priority pop in
//! submission order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::sync::Notify;

/// Higher scheduling class first. Order of variants is the order of
/// service within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
  RecentWindow,
  Incremental,
  Backfill,
  Attachment,
}

/// Which UIDs an envelope batch covers: an explicit set, or everything
/// the server holds above a watermark (IDLE-triggered incrementals).
#[derive(Debug, Clone)]
pub enum UidSelection {
  Explicit(Vec<u32>),
  After(u32),
}

#[derive(Debug, Clone)]
pub enum TaskKind {
  /// Resolve the folder list and per-folder UIDVALIDITY
  FolderList,
  /// Fetch envelopes for a UID selection within a folder
  EnvelopeBatch { folder: String, selection: UidSelection },
  /// Fetch full bodies for a group of UIDs
  BodyFetch { folder: String, uids: Vec<u32>, estimated_bytes: u64 },
  /// Download one attachment to disk
  AttachmentFetch { folder: String, uid: u32, mail_id: String, filename: String },
  /// Run the calendar sync-token delta
  CalDavDelta {
    calendar_id: String,
    sync_token: Option<String>,
    window_start: Option<DateTime<Utc>>,
  },
  /// Refresh one event by provider id
  CalDavEvent { calendar_id: String, provider_event_id: String },
  /// Low-priority reverse-chronological history batch
  BackfillWindow { folder: String, before: DateTime<Utc>, floor: DateTime<Utc> },
}

impl TaskKind {
  pub fn label(&self) -> &'static str {
    match self {
      TaskKind::FolderList => "folder-list",
      TaskKind::EnvelopeBatch { .. } => "envelope-batch",
      TaskKind::BodyFetch { .. } => "body-fetch",
      TaskKind::AttachmentFetch { .. } => "attachment-fetch",
      TaskKind::CalDavDelta { .. } => "caldav-delta",
      TaskKind::CalDavEvent { .. } => "caldav-event",
      TaskKind::BackfillWindow { .. } => "backfill",
    }
  }
}

#[derive(Debug, Clone)]
pub struct FetchTask {
  pub account_id: String,
  pub kind: TaskKind,
  pub priority: Priority,
  pub attempt: u32,
}

impl FetchTask {
  pub fn new(account_id: impl Into<String>, kind: TaskKind, priority: Priority) -> Self {
    Self {
      account_id: account_id.into(),
      kind,
      priority,
      attempt: 0,
    }
  }
}

struct Queued {
  task: FetchTask,
  seq: u64,
}

impl PartialEq for Queued {
  fn eq(&self, other: &Self) -> bool {
    self.task.priority == other.task.priority && self.seq == other.seq
  }
}
impl Eq for Queued {}

impl PartialOrd for Queued {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// BinaryHeap is a max-heap; invert so the lowest (priority, seq) pops first.
impl Ord for Queued {
  fn cmp(&self, other: &Self) -> Ordering {
    (other.task.priority, other.seq).cmp(&(self.task.priority, self.seq))
  }
}

#[derive(Default)]
struct Inner {
  heaps: HashMap<String, BinaryHeap<Queued>>,
  round_robin: VecDeque<String>,
  seq: u64,
}

/// Shared multi-account fetch queue.
pub struct TaskQueue {
  inner: Mutex<Inner>,
  notify: Notify,
}

impl TaskQueue {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      notify: Notify::new(),
    }
  }

  pub fn push(&self, task: FetchTask) {
    {
      let mut inner = self.inner.lock();
      inner.seq += 1;
      let seq = inner.seq;
      let account = task.account_id.clone();
      if !inner.round_robin.contains(&account) {
        inner.round_robin.push_back(account.clone());
      }
      inner.heaps.entry(account).or_default().push(Queued { task, seq });
    }
    self.notify.notify_one();
  }

  /// Pop the next task: rotate accounts, take each account's best task.
  pub async fn pop(&self) -> FetchTask {
    loop {
      {
        let mut inner = self.inner.lock();
        let rotation = inner.round_robin.len();
        for _ in 0..rotation {
          let account = inner.round_robin.pop_front().unwrap();
          inner.round_robin.push_back(account.clone());
          if let Some(heap) = inner.heaps.get_mut(&account) {
            if let Some(queued) = heap.pop() {
              return queued.task;
            }
          }
        }
      }
      self.notify.notified().await;
    }
  }

  /// Drop every queued task for an account (Disabled / NeedsReauth).
  pub fn cancel_account(&self, account_id: &str) -> usize {
    let mut inner = self.inner.lock();
    inner.heaps.remove(account_id).map(|heap| heap.len()).unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().heaps.values().map(|heap| heap.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for TaskQueue {
  fn default() -> Self {
    Self::new()
  }
}
