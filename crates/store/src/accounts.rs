//! Accounts table operations. Deleting an account cascades to both item
//! tables before the account row itself goes, so no orphan rows survive.

use arrow_array::{RecordBatch, RecordBatchIterator};
use futures::TryStreamExt;
use groundeffect_core::Account;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::info;

use crate::connection::{Result, Store};
use crate::schema::{account_schema, account_to_batch, batch_to_account};

fn quote(s: &str) -> String {
  s.replace('\'', "''")
}

impl Store {
  pub async fn upsert_account(&self, account: &Account) -> Result<()> {
    self.require_writable()?;
    let table = self.accounts_table()?;
    let batch = account_to_batch(account)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], account_schema());

    let mut merge = table.merge_insert(&["id"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(batches)).await?;
    Ok(())
  }

  pub async fn get_account(&self, id: &str) -> Result<Option<Account>> {
    let table = self.accounts_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}'", quote(id)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    match batches.first() {
      Some(batch) if batch.num_rows() > 0 => Ok(Some(batch_to_account(batch, 0)?)),
      _ => Ok(None),
    }
  }

  pub async fn list_accounts(&self) -> Result<Vec<Account>> {
    let table = self.accounts_table()?;
    let batches: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut accounts = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        accounts.push(batch_to_account(batch, row)?);
      }
    }
    accounts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(accounts)
  }

  /// Delete an account and every row keyed by it: mail, events, then the
  /// account row.
  pub async fn delete_account(&self, account_id: &str) -> Result<()> {
    self.require_writable()?;

    let filter = format!("account_id = '{}'", quote(account_id));
    self.mail_table()?.delete(&filter).await?;
    self.events_table()?.delete(&filter).await?;
    self
      .accounts_table()?
      .delete(&format!("id = '{}'", quote(account_id)))
      .await?;

    info!("deleted account {} and all its items", account_id);
    Ok(())
  }

  /// Clear synced items but keep the account row (operator reset).
  pub async fn clear_account_data(&self, account_id: &str) -> Result<(u64, u64)> {
    self.require_writable()?;

    let mail_count = self.count_mail(Some(account_id)).await?;
    let event_count = self.count_events(Some(account_id)).await?;

    let filter = format!("account_id = '{}'", quote(account_id));
    self.mail_table()?.delete(&filter).await?;
    self.events_table()?.delete(&filter).await?;

    info!("cleared {} mail and {} events for {}", mail_count, event_count, account_id);
    Ok((mail_count, event_count))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use groundeffect_core::{AccountStatus, Address, EventStatus, EventTime, MailItem, Transparency};
  use tempfile::TempDir;

  async fn store(dir: &TempDir) -> Store {
    Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
      .await
      .unwrap()
  }

  fn mail(account: &str) -> MailItem {
    MailItem {
      id: MailItem::stable_id(account, "<m1@x>"),
      account_id: account.into(),
      account_alias: None,
      message_id: "<m1@x>".into(),
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
      subject: "s".into(),
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

  fn event(account: &str) -> groundeffect_core::CalendarItem {
    groundeffect_core::CalendarItem {
      id: groundeffect_core::CalendarItem::stable_id(account, "ev1"),
      account_id: account.into(),
      account_alias: None,
      provider_event_id: "ev1".into(),
      ical_uid: "ev1@g".into(),
      etag: "\"1\"".into(),
      summary: "s".into(),
      description: None,
      location: None,
      start: EventTime::DateTime(Utc::now()),
      end: EventTime::DateTime(Utc::now()),
      timezone: "UTC".into(),
      all_day: false,
      recurrence_rule: None,
      recurrence_id: None,
      organizer: None,
      attendees: vec![],
      status: EventStatus::Confirmed,
      transparency: Transparency::Busy,
      reminders: vec![],
      embedding: None,
      needs_embedding: true,
      calendar_id: "primary".into(),
      synced_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_account_upsert_updates_in_place() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    let mut account = Account::new("a@x.test", "A");
    store.upsert_account(&account).await.unwrap();

    account.status = AccountStatus::NeedsReauth;
    account.last_email_sync = Some(Utc::now());
    store.upsert_account(&account).await.unwrap();

    let accounts = store.list_accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].status, AccountStatus::NeedsReauth);
    assert!(accounts[0].last_email_sync.is_some());
  }

  #[tokio::test]
  async fn test_delete_cascades_to_items() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    store.upsert_account(&Account::new("a@x.test", "A")).await.unwrap();
    store.upsert_account(&Account::new("b@y.test", "B")).await.unwrap();
    store.upsert_mail(&[mail("a@x.test"), mail("b@y.test")]).await.unwrap();
    store.upsert_events(&[event("a@x.test")]).await.unwrap();

    store.delete_account("a@x.test").await.unwrap();

    assert!(store.get_account("a@x.test").await.unwrap().is_none());
    assert_eq!(store.count_mail(Some("a@x.test")).await.unwrap(), 0);
    assert_eq!(store.count_events(Some("a@x.test")).await.unwrap(), 0);
    // The other account is untouched.
    assert_eq!(store.count_mail(Some("b@y.test")).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_clear_keeps_account_row() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;

    store.upsert_account(&Account::new("a@x.test", "A")).await.unwrap();
    store.upsert_mail(&[mail("a@x.test")]).await.unwrap();

    let (mail_count, event_count) = store.clear_account_data("a@x.test").await.unwrap();
    assert_eq!((mail_count, event_count), (1, 0));
    assert!(store.get_account("a@x.test").await.unwrap().is_some());
    assert_eq!(store.count_mail(Some("a@x.test")).await.unwrap(), 0);
  }
}
