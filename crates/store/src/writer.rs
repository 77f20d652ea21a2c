//! Commit batching for the writer process.
//!
//! All writes funnel through one StoreWriter task. Operations accumulate
//! until the batch reaches 100 items or 5 seconds of wall-clock time,
//! whichever comes first, then land as one flush applied in the order
//! inserts, updates, deletes. Senders can await the flush through the
//! ack channel; the orchestrator uses that for its first-commit
//! transition to Live.

use groundeffect_core::{Account, CalendarItem, MailItem};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::connection::{Result, Store};

pub const MAX_BATCH_ITEMS: usize = 100;
pub const MAX_BATCH_AGE: Duration = Duration::from_secs(5);

/// One logical write. Upserts for an existing id count as updates,
/// applied after inserts; deletes always run last.
#[derive(Debug)]
pub enum WriteOp {
  UpsertMail(Vec<MailItem>),
  UpsertEvents(Vec<CalendarItem>),
  UpsertAccount(Box<Account>),
  DeleteMail { account_id: String, ids: Vec<String> },
  DeleteEvents { account_id: String, provider_event_ids: Vec<String> },
  RemapFolder {
    account_id: String,
    folder: String,
    new_validity: u32,
    mapping: HashMap<String, u32>,
  },
}

impl WriteOp {
  fn weight(&self) -> usize {
    match self {
      WriteOp::UpsertMail(items) => items.len(),
      WriteOp::UpsertEvents(items) => items.len(),
      WriteOp::UpsertAccount(_) => 1,
      WriteOp::DeleteMail { ids, .. } => ids.len(),
      WriteOp::DeleteEvents { provider_event_ids, .. } => provider_event_ids.len(),
      WriteOp::RemapFolder { mapping, .. } => mapping.len().max(1),
    }
  }
}

struct Submission {
  op: WriteOp,
  ack: Option<oneshot::Sender<Result<()>>>,
}

/// Cloneable handle for enqueueing writes.
#[derive(Clone)]
pub struct WriterHandle {
  tx: mpsc::Sender<Submission>,
}

impl WriterHandle {
  /// Fire-and-forget enqueue.
  pub async fn submit(&self, op: WriteOp) {
    if self.tx.send(Submission { op, ack: None }).await.is_err() {
      error!("store writer is gone, dropping write");
    }
  }

  /// Enqueue and wait until the batch containing this op has committed.
  pub async fn submit_and_wait(&self, op: WriteOp) -> Result<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    if self
      .tx
      .send(Submission {
        op,
        ack: Some(ack_tx),
      })
      .await
      .is_err()
    {
      return Err(crate::connection::StoreError::Decode("store writer is gone".into()));
    }
    ack_rx
      .await
      .unwrap_or_else(|_| Err(crate::connection::StoreError::Decode("store writer dropped ack".into())))
  }
}

/// The single writer task. Owns the only writable Store handle.
pub struct StoreWriter {
  store: Arc<Store>,
  rx: mpsc::Receiver<Submission>,
}

impl StoreWriter {
  pub fn new(store: Arc<Store>) -> (Self, WriterHandle) {
    let (tx, rx) = mpsc::channel(1024);
    (Self { store, rx }, WriterHandle { tx })
  }

  /// Run until every sender is dropped, then flush what remains.
  pub async fn run(mut self) {
    let mut pending: Vec<Submission> = Vec::new();
    let mut pending_weight = 0usize;
    let mut deadline = tokio::time::Instant::now() + MAX_BATCH_AGE;

    loop {
      let timeout = tokio::time::sleep_until(deadline);
      tokio::select! {
        submission = self.rx.recv() => {
          match submission {
            Some(submission) => {
              if pending.is_empty() {
                deadline = tokio::time::Instant::now() + MAX_BATCH_AGE;
              }
              pending_weight += submission.op.weight();
              pending.push(submission);
              if pending_weight >= MAX_BATCH_ITEMS {
                self.flush(&mut pending).await;
                pending_weight = 0;
                deadline = tokio::time::Instant::now() + MAX_BATCH_AGE;
              }
            }
            None => {
              self.flush(&mut pending).await;
              info!("store writer draining complete");
              return;
            }
          }
        }
        _ = timeout => {
          if !pending.is_empty() {
            self.flush(&mut pending).await;
            pending_weight = 0;
          }
          deadline = tokio::time::Instant::now() + MAX_BATCH_AGE;
        }
      }
    }
  }

  /// Apply one batch: inserts/updates first, then remaps, then deletes.
  /// The whole batch resolves to one result for every waiter.
  async fn flush(&self, pending: &mut Vec<Submission>) {
    if pending.is_empty() {
      return;
    }
    let submissions: Vec<Submission> = pending.drain(..).collect();
    let count = submissions.len();

    let mut mail_upserts: Vec<MailItem> = Vec::new();
    let mut event_upserts: Vec<CalendarItem> = Vec::new();
    let mut account_upserts: Vec<Account> = Vec::new();
    let mut remaps = Vec::new();
    let mut mail_deletes: Vec<(String, Vec<String>)> = Vec::new();
    let mut event_deletes: Vec<(String, Vec<String>)> = Vec::new();
    let mut acks = Vec::new();

    for submission in submissions {
      match submission.op {
        WriteOp::UpsertMail(items) => {
          // Later observations of the same id win within a batch.
          for item in items {
            if let Some(existing) = mail_upserts.iter_mut().find(|m| m.id == item.id) {
              *existing = item;
            } else {
              mail_upserts.push(item);
            }
          }
        }
        WriteOp::UpsertEvents(items) => {
          for item in items {
            if let Some(existing) = event_upserts.iter_mut().find(|e| e.id == item.id) {
              *existing = item;
            } else {
              event_upserts.push(item);
            }
          }
        }
        WriteOp::UpsertAccount(account) => account_upserts.push(*account),
        WriteOp::RemapFolder {
          account_id,
          folder,
          new_validity,
          mapping,
        } => remaps.push((account_id, folder, new_validity, mapping)),
        WriteOp::DeleteMail { account_id, ids } => mail_deletes.push((account_id, ids)),
        WriteOp::DeleteEvents {
          account_id,
          provider_event_ids,
        } => event_deletes.push((account_id, provider_event_ids)),
      }
      if let Some(ack) = submission.ack {
        acks.push(ack);
      }
    }

    let result = self
      .apply(
        mail_upserts,
        event_upserts,
        account_upserts,
        remaps,
        mail_deletes,
        event_deletes,
      )
      .await;

    match &result {
      Ok(()) => debug!("committed batch of {} ops", count),
      Err(e) => error!("commit failed: {}", e),
    }

    for ack in acks {
      let _ = ack.send(match &result {
        Ok(()) => Ok(()),
        Err(e) => Err(crate::connection::StoreError::Decode(e.to_string())),
      });
    }
  }

  #[allow(clippy::too_many_arguments)]
  async fn apply(
    &self,
    mail_upserts: Vec<MailItem>,
    event_upserts: Vec<CalendarItem>,
    account_upserts: Vec<Account>,
    remaps: Vec<(String, String, u32, HashMap<String, u32>)>,
    mail_deletes: Vec<(String, Vec<String>)>,
    event_deletes: Vec<(String, Vec<String>)>,
  ) -> Result<()> {
    let wrote_rows = !mail_upserts.is_empty() || !event_upserts.is_empty();

    // Inserts and updates
    self.store.upsert_mail(&mail_upserts).await?;
    self.store.upsert_events(&event_upserts).await?;
    for account in &account_upserts {
      self.store.upsert_account(account).await?;
    }

    // In-place remaps drain before deletes so the stale-epoch sweep sees
    // the final mapping.
    for (account_id, folder, new_validity, mapping) in &remaps {
      self
        .store
        .remap_folder_uids(account_id, folder, *new_validity, mapping)
        .await?;
    }

    // Deletes last
    for (account_id, ids) in &mail_deletes {
      self.store.delete_mail(account_id, ids).await?;
    }
    for (account_id, provider_event_ids) in &event_deletes {
      self.store.delete_events(account_id, provider_event_ids).await?;
    }

    // New fragments only become keyword-searchable after an index pass.
    if wrote_rows {
      self.store.rebuild_fts().await?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use groundeffect_core::Address;
  use tempfile::TempDir;

  fn mail(message_id: &str, subject: &str) -> MailItem {
    MailItem {
      id: MailItem::stable_id("a@x.test", message_id),
      account_id: "a@x.test".into(),
      account_alias: None,
      message_id: message_id.into(),
      provider_message_id: 1,
      thread_id: 1,
      uid: 1,
      uid_validity: 1,
      in_reply_to: None,
      references: vec![],
      folder: "INBOX".into(),
      labels: vec![],
      flags: vec![],
      from: Address::new("pat@z.test"),
      to: vec![],
      cc: vec![],
      bcc: vec![],
      subject: subject.into(),
      date: Utc::now(),
      body_plain: "b".into(),
      body_html: None,
      snippet: "b".into(),
      attachments: vec![],
      embedding: None,
      needs_embedding: true,
      synced_at: Utc::now(),
      raw_size: 1,
    }
  }

  #[tokio::test]
  async fn test_submit_and_wait_commits() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
      Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
        .await
        .unwrap(),
    );

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let task = tokio::spawn(writer.run());

    handle
      .submit_and_wait(WriteOp::UpsertMail(vec![mail("<m1@x>", "hello")]))
      .await
      .unwrap();
    assert_eq!(store.count_mail(None).await.unwrap(), 1);

    drop(handle);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_same_item_upserted_twice_in_one_batch_lands_once() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
      Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
        .await
        .unwrap(),
    );

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let task = tokio::spawn(writer.run());

    handle.submit(WriteOp::UpsertMail(vec![mail("<m1@x>", "first")])).await;
    handle
      .submit_and_wait(WriteOp::UpsertMail(vec![mail("<m1@x>", "second")]))
      .await
      .unwrap();

    assert_eq!(store.count_mail(None).await.unwrap(), 1);
    let back = store
      .get_mail(&MailItem::stable_id("a@x.test", "<m1@x>"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(back.subject, "second");

    drop(handle);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_deletes_apply_after_inserts() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
      Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
        .await
        .unwrap(),
    );

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let task = tokio::spawn(writer.run());

    // Same batch: insert one item and delete another that exists.
    handle
      .submit_and_wait(WriteOp::UpsertMail(vec![mail("<old@x>", "old")]))
      .await
      .unwrap();
    handle.submit(WriteOp::UpsertMail(vec![mail("<new@x>", "new")])).await;
    handle
      .submit_and_wait(WriteOp::DeleteMail {
        account_id: "a@x.test".into(),
        ids: vec![MailItem::stable_id("a@x.test", "<old@x>")],
      })
      .await
      .unwrap();

    assert_eq!(store.count_mail(None).await.unwrap(), 1);
    assert!(
      store
        .get_mail(&MailItem::stable_id("a@x.test", "<new@x>"))
        .await
        .unwrap()
        .is_some()
    );

    drop(handle);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_writer_drains_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
      Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
        .await
        .unwrap(),
    );

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let task = tokio::spawn(writer.run());

    handle.submit(WriteOp::UpsertMail(vec![mail("<m1@x>", "pending")])).await;
    drop(handle); // close the channel without waiting for the 5 s tick

    task.await.unwrap();
    assert_eq!(store.count_mail(None).await.unwrap(), 1);
  }
}
