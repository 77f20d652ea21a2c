//! Events table operations.

use arrow_array::{RecordBatch, RecordBatchIterator, StringArray};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use groundeffect_core::CalendarItem;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use std::collections::HashMap;
use tracing::debug;

use crate::connection::{Result, Store};
use crate::schema::{batch_to_event, event_schema, events_to_batch};

fn quote(s: &str) -> String {
  s.replace('\'', "''")
}

impl Store {
  /// Insert or update events, keyed on the stable id.
  pub async fn upsert_events(&self, items: &[CalendarItem]) -> Result<()> {
    self.require_writable()?;
    if items.is_empty() {
      return Ok(());
    }

    let table = self.events_table()?;
    let batch = events_to_batch(items)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], event_schema());

    let mut merge = table.merge_insert(&["id"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(batches)).await?;

    debug!("upserted {} events", items.len());
    Ok(())
  }

  pub async fn get_event(&self, id: &str) -> Result<Option<CalendarItem>> {
    let table = self.events_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}'", quote(id)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    match batches.first() {
      Some(batch) if batch.num_rows() > 0 => Ok(Some(batch_to_event(batch, 0)?)),
      _ => Ok(None),
    }
  }

  pub async fn get_events_batch(&self, ids: &[String]) -> Result<Vec<CalendarItem>> {
    if ids.is_empty() {
      return Ok(vec![]);
    }
    let table = self.events_table()?;
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
        items.push(batch_to_event(batch, row)?);
      }
    }
    Ok(items)
  }

  pub async fn count_events(&self, account_id: Option<&str>) -> Result<u64> {
    let table = self.events_table()?;
    let filter = account_id.map(|id| format!("account_id = '{}'", quote(id)));
    Ok(table.count_rows(filter).await? as u64)
  }

  /// etag per provider event id, for change detection in the CalDAV delta.
  pub async fn event_etags(&self, account_id: &str) -> Result<HashMap<String, String>> {
    let table = self.events_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .select(Select::columns(&["provider_event_id", "etag"]))
      .only_if(format!("account_id = '{}'", quote(account_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut etags = HashMap::new();
    for batch in &batches {
      let ids = batch
        .column_by_name("provider_event_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
      let tags = batch
        .column_by_name("etag")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
      if let (Some(ids), Some(tags)) = (ids, tags) {
        for row in 0..batch.num_rows() {
          etags.insert(ids.value(row).to_string(), tags.value(row).to_string());
        }
      }
    }
    Ok(etags)
  }

  /// Delete events the server reported removed.
  pub async fn delete_events(&self, account_id: &str, provider_event_ids: &[String]) -> Result<()> {
    self.require_writable()?;
    if provider_event_ids.is_empty() {
      return Ok(());
    }
    let table = self.events_table()?;
    let id_list: Vec<String> = provider_event_ids.iter().map(|id| format!("'{}'", quote(id))).collect();
    table
      .delete(&format!(
        "account_id = '{}' AND provider_event_id IN ({})",
        quote(account_id),
        id_list.join(", ")
      ))
      .await?;
    Ok(())
  }

  /// Events overlapping [from, to), chronological.
  pub async fn list_events_in_range(
    &self,
    accounts: Option<&[String]>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<CalendarItem>> {
    let table = self.events_table()?;

    let mut filters = vec![
      format!("start_ts >= {}", from.timestamp()),
      format!("start_ts < {}", to.timestamp()),
    ];
    if let Some(accounts) = accounts {
      if !accounts.is_empty() {
        let list: Vec<String> = accounts.iter().map(|a| format!("'{}'", quote(a))).collect();
        filters.push(format!("account_id IN ({})", list.join(", ")));
      }
    }

    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(filters.join(" AND "))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut items = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        items.push(batch_to_event(batch, row)?);
      }
    }
    items.sort_by(|a, b| a.start.as_instant().cmp(&b.start.as_instant()));
    items.truncate(limit);
    Ok(items)
  }

  /// Events flagged for re-embedding.
  pub async fn events_needing_embedding(&self, limit: usize) -> Result<Vec<CalendarItem>> {
    let table = self.events_table()?;
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
        items.push(batch_to_event(batch, row)?);
      }
    }
    Ok(items)
  }

  /// Distinct calendar ids synced for an account.
  pub async fn list_calendars(&self, account_id: &str) -> Result<Vec<String>> {
    let table = self.events_table()?;
    let batches: Vec<RecordBatch> = table
      .query()
      .select(Select::columns(&["calendar_id"]))
      .only_if(format!("account_id = '{}'", quote(account_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut calendars = std::collections::BTreeSet::new();
    for batch in &batches {
      if let Some(ids) = batch
        .column_by_name("calendar_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      {
        for row in 0..batch.num_rows() {
          calendars.insert(ids.value(row).to_string());
        }
      }
    }
    Ok(calendars.into_iter().collect())
  }
}
