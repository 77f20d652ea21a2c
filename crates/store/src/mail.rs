//! Mail table operations.
//!
//! Upserts go through merge_insert keyed on `id`, so a duplicate
//! delivery of the same (account, Message-ID) updates the existing row
//! in place rather than delete-and-reinsert within a commit.

use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use futures::TryStreamExt;
use groundeffect_core::MailItem;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use tracing::{debug, info};

use crate::connection::{Result, Store};
use crate::schema::{batch_to_mail, mail_schema, mail_to_batch};

fn quote(s: &str) -> String {
  s.replace('\'', "''")
}

impl Store {
  /// Insert or update mail items, keyed on the stable id.
  pub async fn upsert_mail(&self, items: &[MailItem]) -> Result<()> {
    self.require_writable()?;
    if items.is_empty() {
      return Ok(());
    }

    let table = self.mail_table()?;
    let batch = mail_to_batch(items)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], mail_schema());

    let mut merge = table.merge_insert(&["id"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(batches)).await?;

    debug!("upserted {} mail items", items.len());
    Ok(())
  }

  pub async fn get_mail(&self, id: &str) -> Result<Option<MailItem>> {
    let table = self.mail_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}'", quote(id)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    match batches.first() {
      Some(batch) if batch.num_rows() > 0 => Ok(Some(batch_to_mail(batch, 0)?)),
      _ => Ok(None),
    }
  }

  /// Batch point-lookup preserving nothing about input order.
  pub async fn get_mail_batch(&self, ids: &[String]) -> Result<Vec<MailItem>> {
    if ids.is_empty() {
      return Ok(vec![]);
    }
    let table = self.mail_table()?;
    let id_list: Vec<String> = ids.iter().map(|id| format!("'{}'", quote(id))).collect();
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id IN ({})", id_list.join(", ")))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut items = Vec::with_capacity(ids.len());
    for batch in &batches {
      for row in 0..batch.num_rows() {
        items.push(batch_to_mail(batch, row)?);
      }
    }
    Ok(items)
  }

  /// All messages in a thread, oldest first.
  pub async fn get_thread(&self, account_id: &str, thread_id: u64) -> Result<Vec<MailItem>> {
    let table = self.mail_table()?;
    let filter = format!("account_id = '{}' AND thread_id = {}", quote(account_id), thread_id);
    let batches: Vec<RecordBatch> = table.query().only_if(filter).execute().await?.try_collect().await?;

    let mut items = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        items.push(batch_to_mail(batch, row)?);
      }
    }
    items.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(items)
  }

  pub async fn count_mail(&self, account_id: Option<&str>) -> Result<u64> {
    let table = self.mail_table()?;
    let filter = account_id.map(|id| format!("account_id = '{}'", quote(id)));
    Ok(table.count_rows(filter).await? as u64)
  }

  /// Recent mail without search, newest first.
  pub async fn list_recent_mail(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<MailItem>> {
    let filter = account_id.map(|id| format!("account_id = '{}'", quote(id)));
    self.list_mail_filtered(filter.as_deref(), limit).await
  }

  /// Mail matching an arbitrary predicate, newest first. Backs the
  /// empty-query search path.
  pub async fn list_mail_filtered(&self, filter: Option<&str>, limit: usize) -> Result<Vec<MailItem>> {
    let table = self.mail_table()?;
    let mut query = table.query();
    if let Some(filter) = filter {
      query = query.only_if(filter.to_string());
    }
    let batches: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut items = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        items.push(batch_to_mail(batch, row)?);
      }
    }
    items.sort_by(|a, b| b.date.cmp(&a.date));
    items.truncate(limit);
    Ok(items)
  }

  /// Delete mail rows by stable id.
  pub async fn delete_mail(&self, account_id: &str, ids: &[String]) -> Result<()> {
    self.require_writable()?;
    if ids.is_empty() {
      return Ok(());
    }
    let table = self.mail_table()?;
    let id_list: Vec<String> = ids.iter().map(|id| format!("'{}'", quote(id))).collect();
    table
      .delete(&format!(
        "account_id = '{}' AND id IN ({})",
        quote(account_id),
        id_list.join(", ")
      ))
      .await?;
    Ok(())
  }

  /// Known (message_id -> uid) pairs for one folder, used by the remap
  /// task and by incremental dedup.
  pub async fn mail_uid_map(
    &self,
    account_id: &str,
    folder: &str,
  ) -> Result<std::collections::HashMap<String, u32>> {
    let table = self.mail_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .select(Select::columns(&["message_id", "uid"]))
      .only_if(format!(
        "account_id = '{}' AND folder = '{}'",
        quote(account_id),
        quote(folder)
      ))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut map = std::collections::HashMap::new();
    for batch in &batches {
      let message_ids = batch
        .column_by_name("message_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
      let uids = batch
        .column_by_name("uid")
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
      if let (Some(message_ids), Some(uids)) = (message_ids, uids) {
        for row in 0..batch.num_rows() {
          map.insert(message_ids.value(row).to_string(), uids.value(row));
        }
      }
    }
    Ok(map)
  }

  /// Re-map a folder after a UIDVALIDITY change. Rows whose Message-ID
  /// survives get the new (uid, uid_validity) written in place; rows the
  /// new epoch no longer contains are deleted. After this no row in the
  /// folder carries the old epoch.
  pub async fn remap_folder_uids(
    &self,
    account_id: &str,
    folder: &str,
    new_validity: u32,
    mapping: &std::collections::HashMap<String, u32>,
  ) -> Result<(usize, usize)> {
    self.require_writable()?;
    let table = self.mail_table()?;

    let mut remapped = 0;
    for (message_id, uid) in mapping {
      let updated = table
        .update()
        .only_if(format!(
          "account_id = '{}' AND folder = '{}' AND message_id = '{}'",
          quote(account_id),
          quote(folder),
          quote(message_id)
        ))
        .column("uid", uid.to_string())
        .column("uid_validity", new_validity.to_string())
        .execute()
        .await?;
      remapped += updated.rows_updated as usize;
    }

    // Anything still on an old epoch vanished from the folder.
    let stale_filter = format!(
      "account_id = '{}' AND folder = '{}' AND uid_validity != {}",
      quote(account_id),
      quote(folder),
      new_validity
    );
    let stale = table.count_rows(Some(stale_filter.clone())).await?;
    if stale > 0 {
      table.delete(&stale_filter).await?;
    }

    info!(
      "remapped folder {}/{} to validity {}: {} updated, {} stale removed",
      account_id, folder, new_validity, remapped, stale
    );
    Ok((remapped, stale))
  }

  /// Replace a row's attachment list in place, leaving the vector and
  /// every other column untouched.
  pub async fn set_mail_attachments(&self, id: &str, attachments: &[groundeffect_core::Attachment]) -> Result<()> {
    self.require_writable()?;
    let table = self.mail_table()?;
    let json = serde_json::to_string(attachments)?;
    table
      .update()
      .only_if(format!("id = '{}'", quote(id)))
      .column("attachments", format!("'{}'", json.replace('\'', "''")))
      .execute()
      .await?;
    Ok(())
  }

  /// Ids and searchable text of rows flagged for re-embedding.
  pub async fn mail_needing_embedding(&self, limit: usize) -> Result<Vec<MailItem>> {
    let table = self.mail_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if("needs_embedding = true")
      .limit(limit)
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut items = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        items.push(batch_to_mail(batch, row)?);
      }
    }
    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};
  use groundeffect_core::{Address, EMBEDDING_DIM};
  use tempfile::TempDir;

  fn item(message_id: &str, uid: u32, days_ago: i64) -> MailItem {
    MailItem {
      id: MailItem::stable_id("a@x.test", message_id),
      account_id: "a@x.test".into(),
      account_alias: None,
      message_id: message_id.into(),
      provider_message_id: uid as u64,
      thread_id: 1,
      uid,
      uid_validity: 1,
      in_reply_to: None,
      references: vec![],
      folder: "INBOX".into(),
      labels: vec![],
      flags: vec![],
      from: Address::new("pat@z.test"),
      to: vec![Address::new("a@x.test")],
      cc: vec![],
      bcc: vec![],
      subject: format!("message {}", uid),
      date: Utc::now() - Duration::days(days_ago),
      body_plain: "body".into(),
      body_html: None,
      snippet: "body".into(),
      attachments: vec![],
      embedding: Some(vec![0.1; EMBEDDING_DIM]),
      needs_embedding: false,
      synced_at: Utc::now(),
      raw_size: 100,
    }
  }

  async fn store(dir: &TempDir) -> Store {
    Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_upsert_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    let first = item("<m1@x>", 1, 0);
    store.upsert_mail(std::slice::from_ref(&first)).await.unwrap();
    store.upsert_mail(std::slice::from_ref(&first)).await.unwrap();
    assert_eq!(store.count_mail(Some("a@x.test")).await.unwrap(), 1);

    // Latest observation wins on mutable fields.
    let mut updated = first.clone();
    updated.flags = vec!["\\Seen".into()];
    updated.subject = "updated".into();
    store.upsert_mail(std::slice::from_ref(&updated)).await.unwrap();

    assert_eq!(store.count_mail(None).await.unwrap(), 1);
    let back = store.get_mail(&first.id).await.unwrap().unwrap();
    assert_eq!(back.subject, "updated");
    assert!(back.is_read());
  }

  #[tokio::test]
  async fn test_thread_scan_orders_by_date() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    let newer = item("<m2@x>", 2, 1);
    let older = item("<m1@x>", 1, 5);
    store.upsert_mail(&[newer, older]).await.unwrap();

    let thread = store.get_thread("a@x.test", 1).await.unwrap();
    assert_eq!(thread.len(), 2);
    assert!(thread[0].date < thread[1].date);
    assert_eq!(thread[0].message_id, "<m1@x>");
  }

  #[tokio::test]
  async fn test_uid_validity_remap_leaves_no_stale_rows() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    store.upsert_mail(&[item("<m1@x>", 1, 0), item("<m2@x>", 2, 0)]).await.unwrap();

    // New epoch: <m1@x> survives with a fresh UID, <m2@x> is gone.
    let mut mapping = std::collections::HashMap::new();
    mapping.insert("<m1@x>".to_string(), 501u32);

    let (remapped, stale) = store.remap_folder_uids("a@x.test", "INBOX", 9, &mapping).await.unwrap();
    assert_eq!(remapped, 1);
    assert_eq!(stale, 1);

    let survivor = store
      .get_mail(&MailItem::stable_id("a@x.test", "<m1@x>"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(survivor.uid, 501);
    assert_eq!(survivor.uid_validity, 9);

    // Logical identity preserved, stale pair gone.
    assert_eq!(store.count_mail(None).await.unwrap(), 1);
    let table = store.mail_table().unwrap();
    assert_eq!(table.count_rows(Some("uid_validity != 9".to_string())).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_delete_mail_scoped_to_account() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    let mine = item("<m1@x>", 1, 0);
    let mut theirs = item("<m1@x>", 1, 0);
    theirs.id = MailItem::stable_id("b@y.test", "<m1@x>");
    theirs.account_id = "b@y.test".into();
    store.upsert_mail(&[mine.clone(), theirs]).await.unwrap();

    store.delete_mail("a@x.test", &[mine.id.clone()]).await.unwrap();
    assert_eq!(store.count_mail(Some("a@x.test")).await.unwrap(), 0);
    assert_eq!(store.count_mail(Some("b@y.test")).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_needs_embedding_scan() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    let mut broken = item("<m1@x>", 1, 0);
    broken.embedding = None;
    broken.needs_embedding = true;
    store.upsert_mail(&[broken, item("<m2@x>", 2, 0)]).await.unwrap();

    let pending = store.mail_needing_embedding(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, "<m1@x>");
  }
}
