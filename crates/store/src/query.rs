//! Keyword and vector query primitives.
//!
//! Both return (id, score) lists under a shared predicate; rank fusion
//! lives with the query planner, not here. The keyword side reads the
//! BM25 `_score` column, the vector side converts `_distance` into a
//! similarity so larger is always better.

use arrow_array::{Float32Array, RecordBatch, StringArray};
use futures::TryStreamExt;
use lance_index::scalar::FullTextSearchQuery;
use lancedb::Table;
use lancedb::query::{ExecutableQuery, QueryBase, Select};

use crate::connection::{Result, Store};

/// Which item table a query runs against. Mail and calendar share the
/// same search interface; only the table and text fields differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
  Mail,
  Events,
}

/// One ranked hit.
pub type ScoredId = (String, f32);

impl Store {
  fn table_for(&self, kind: TableKind) -> Result<Table> {
    match kind {
      TableKind::Mail => self.mail_table(),
      TableKind::Events => self.events_table(),
    }
  }

  /// BM25 keyword ranking, best first.
  pub async fn keyword_search(
    &self,
    kind: TableKind,
    query: &str,
    filter: Option<&str>,
    limit: usize,
  ) -> Result<Vec<ScoredId>> {
    let table = self.table_for(kind)?;

    let fts = FullTextSearchQuery::new(query.to_owned());
    let mut search = table.query().full_text_search(fts);
    if let Some(filter) = filter {
      search = search.only_if(filter.to_string());
    }

    let batches: Vec<RecordBatch> = search
      .limit(limit)
      .select(Select::columns(&["id", "_score"]))
      .execute()
      .await?
      .try_collect()
      .await?;

    Ok(collect_scores(&batches, "_score", |s, _| s))
  }

  /// Cosine-similarity vector ranking, best first.
  pub async fn vector_search(
    &self,
    kind: TableKind,
    query_vector: &[f32],
    filter: Option<&str>,
    limit: usize,
  ) -> Result<Vec<ScoredId>> {
    let table = self.table_for(kind)?;

    let mut search = table.vector_search(query_vector.to_vec())?;
    if let Some(filter) = filter {
      search = search.only_if(filter.to_string());
    }

    let batches: Vec<RecordBatch> = search
      .limit(limit)
      .select(Select::columns(&["id", "_distance"]))
      .execute()
      .await?
      .try_collect()
      .await?;

    // Smaller distance is better; invert so callers always maximise.
    Ok(collect_scores(&batches, "_distance", |d, _| 1.0 / (1.0 + d)))
  }
}

fn collect_scores(batches: &[RecordBatch], score_column: &str, to_score: fn(f32, usize) -> f32) -> Vec<ScoredId> {
  let mut results = Vec::new();
  for batch in batches {
    let ids = batch
      .column_by_name("id")
      .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let Some(ids) = ids else { continue };
    let scores = batch
      .column_by_name(score_column)
      .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    for row in 0..batch.num_rows() {
      let rank = results.len();
      let raw = scores.map(|s| s.value(row)).unwrap_or(1.0 / (rank as f32 + 1.0));
      results.push((ids.value(row).to_string(), to_score(raw, rank)));
    }
  }
  results
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use groundeffect_core::{Address, EMBEDDING_DIM, MailItem};
  use tempfile::TempDir;

  fn mail(message_id: &str, subject: &str, body: &str, seed: f32) -> MailItem {
    // A crude one-hot-ish embedding so vector search has signal.
    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    embedding[(seed as usize) % EMBEDDING_DIM] = 1.0;

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
      body_plain: body.into(),
      body_html: None,
      snippet: body.chars().take(200).collect(),
      attachments: vec![],
      embedding: Some(embedding),
      needs_embedding: false,
      synced_at: Utc::now(),
      raw_size: 1,
    }
  }

  #[tokio::test]
  async fn test_vector_search_orders_by_similarity() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
      .await
      .unwrap();

    store
      .upsert_mail(&[
        mail("<m1@x>", "invoice", "the invoice", 3.0),
        mail("<m2@x>", "lunch", "sandwiches", 9.0),
      ])
      .await
      .unwrap();

    let mut query = vec![0.0f32; EMBEDDING_DIM];
    query[3] = 1.0;

    let hits = store.vector_search(TableKind::Mail, &query, None, 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, MailItem::stable_id("a@x.test", "<m1@x>"));
    assert!(hits[0].1 > hits[1].1);
  }

  #[tokio::test]
  async fn test_vector_search_respects_filter() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_writer(&dir.path().join("lancedb"), &dir.path().join("writer.lock"))
      .await
      .unwrap();

    store
      .upsert_mail(&[
        mail("<m1@x>", "a", "a", 1.0),
        mail("<m2@x>", "b", "b", 2.0),
      ])
      .await
      .unwrap();

    let query = vec![0.1f32; EMBEDDING_DIM];
    let hits = store
      .vector_search(TableKind::Mail, &query, Some("subject = 'b'"), 10)
      .await
      .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, MailItem::stable_id("a@x.test", "<m2@x>"));
  }
}
