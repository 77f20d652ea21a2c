//! Hybrid search: keyword (BM25) and vector rankings fused with
//! Reciprocal Rank Fusion.
//!
//! The two sub-queries run in parallel against the same predicate at
//! depth max(4·limit, 100); fusion is plain RRF with k = 60 and a
//! stable id tie-break, so identical inputs produce byte-identical
//! orderings. An empty query with filters degrades to a filter scan
//! ordered by date; a keyword-side failure degrades to vector-only and
//! says so.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use embedding::Embedder;
use groundeffect_core::{CalendarItem, Config, Error, MailSummary, Result};
use store::{Store, TableKind};

const RRF_K: f32 = 60.0;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

fn candidate_depth(limit: usize) -> usize {
  (limit * 4).max(100)
}

fn quote(s: &str) -> String {
  s.replace('\'', "''")
}

#[derive(Debug, Clone, Default)]
pub struct MailSearchOptions {
  /// None = all accounts; entries may be aliases or addresses
  pub accounts: Option<Vec<String>>,
  pub limit: usize,
  pub folder: Option<String>,
  /// Sender substring, matched against address and display name
  pub from: Option<String>,
  /// Recipient substring
  pub to: Option<String>,
  pub date_from: Option<DateTime<Utc>>,
  pub date_to: Option<DateTime<Utc>>,
  pub has_attachment: Option<bool>,
}

impl MailSearchOptions {
  pub fn build_filter(&self, accounts: Option<&[String]>) -> Option<String> {
    let mut conditions = Vec::new();

    if let Some(accounts) = accounts {
      if !accounts.is_empty() {
        let list: Vec<String> = accounts.iter().map(|a| format!("'{}'", quote(a))).collect();
        conditions.push(format!("account_id IN ({})", list.join(", ")));
      }
    }
    if let Some(folder) = &self.folder {
      conditions.push(format!("folder = '{}'", quote(folder)));
    }
    if let Some(from) = &self.from {
      let needle = quote(from);
      conditions.push(format!(
        "(from_email LIKE '%{}%' OR from_name LIKE '%{}%')",
        needle, needle
      ));
    }
    if let Some(to) = &self.to {
      // Recipients are stored as a JSON array of {name, email}.
      conditions.push(format!("\"to\" LIKE '%{}%'", quote(to)));
    }
    if let Some(date_from) = &self.date_from {
      conditions.push(format!("date >= {}", date_from.timestamp()));
    }
    if let Some(date_to) = &self.date_to {
      conditions.push(format!("date <= {}", date_to.timestamp()));
    }
    if let Some(has_attachment) = self.has_attachment {
      conditions.push(format!("has_attachments = {}", has_attachment));
    }

    if conditions.is_empty() {
      None
    } else {
      Some(conditions.join(" AND "))
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct CalendarSearchOptions {
  pub accounts: Option<Vec<String>>,
  pub limit: usize,
  pub calendar_id: Option<String>,
  pub date_from: Option<DateTime<Utc>>,
  pub date_to: Option<DateTime<Utc>>,
}

impl CalendarSearchOptions {
  pub fn build_filter(&self, accounts: Option<&[String]>) -> Option<String> {
    let mut conditions = Vec::new();

    if let Some(accounts) = accounts {
      if !accounts.is_empty() {
        let list: Vec<String> = accounts.iter().map(|a| format!("'{}'", quote(a))).collect();
        conditions.push(format!("account_id IN ({})", list.join(", ")));
      }
    }
    if let Some(calendar_id) = &self.calendar_id {
      conditions.push(format!("calendar_id = '{}'", quote(calendar_id)));
    }
    if let Some(date_from) = &self.date_from {
      conditions.push(format!("start_ts >= {}", date_from.timestamp()));
    }
    if let Some(date_to) = &self.date_to {
      conditions.push(format!("start_ts <= {}", date_to.timestamp()));
    }

    if conditions.is_empty() {
      None
    } else {
      Some(conditions.join(" AND "))
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse<T> {
  pub results: Vec<T>,
  pub accounts_searched: Vec<String>,
  pub total_count: usize,
  pub search_time_ms: u64,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarHit {
  #[serde(flatten)]
  pub event: CalendarItem,
  pub score: f32,
}

pub struct SearchEngine {
  store: Arc<Store>,
  embedder: Arc<dyn Embedder>,
  config: Arc<Config>,
}

impl SearchEngine {
  pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>, config: Arc<Config>) -> Self {
    Self {
      store,
      embedder,
      config,
    }
  }

  /// Resolve identifiers (aliases or addresses) to canonical addresses.
  /// Unknown aliases are a validation error; None means every account.
  pub async fn resolve_accounts(&self, identifiers: Option<&[String]>) -> Result<Option<Vec<String>>> {
    let Some(identifiers) = identifiers else { return Ok(None) };
    if identifiers.is_empty() {
      return Ok(None);
    }

    let known = self
      .store
      .list_accounts()
      .await
      .map_err(|e| Error::Store(e.to_string()))?;

    let mut resolved = Vec::with_capacity(identifiers.len());
    for identifier in identifiers {
      // Config aliases first, then the accounts table's own aliases.
      let canonical = self
        .config
        .resolve_account(identifier)
        .or_else(|| known.iter().find(|a| a.matches(identifier)).map(|a| a.id.clone()))
        .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", identifier)))?;
      if !resolved.contains(&canonical) {
        resolved.push(canonical);
      }
    }
    Ok(Some(resolved))
  }

  pub async fn search_mail(&self, query: &str, options: &MailSearchOptions) -> Result<SearchResponse<MailSummary>> {
    let start = Instant::now();
    let limit = clamp_limit(options.limit)?;

    let accounts = self.resolve_accounts(options.accounts.as_deref()).await?;
    let filter = options.build_filter(accounts.as_deref());
    let accounts_searched = match &accounts {
      Some(list) => list.clone(),
      None => self.all_account_ids().await?,
    };

    // Empty query: a filter scan ordered by date descending, both
    // ranking sides skipped.
    if query.trim().is_empty() {
      let items = self
        .store
        .list_mail_filtered(filter.as_deref(), limit)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
      let summaries: Vec<MailSummary> = items.iter().map(MailSummary::from).collect();
      let total_count = summaries.len();
      return Ok(SearchResponse {
        results: summaries,
        accounts_searched,
        total_count,
        search_time_ms: start.elapsed().as_millis() as u64,
        degraded: false,
      });
    }

    let depth = candidate_depth(limit);
    let query_vector = self
      .embedder
      .embed(query)
      .await
      .map_err(|e| Error::Embedding(e.to_string()))?;

    let (keyword, vector) = tokio::join!(
      self.store.keyword_search(TableKind::Mail, query, filter.as_deref(), depth),
      self.store.vector_search(TableKind::Mail, &query_vector, filter.as_deref(), depth),
    );

    let vector = vector.map_err(|e| Error::Store(e.to_string()))?;
    let (keyword, degraded) = match keyword {
      Ok(hits) => (hits, false),
      Err(e) => {
        // Typically the FTS index is not built yet for a fresh table.
        warn!("keyword side failed, degrading to vector-only: {}", e);
        (vec![], true)
      }
    };

    let fused = rrf_fuse(&keyword, &vector);
    let total_count = fused.len();
    let top: Vec<(String, f32)> = fused.into_iter().take(limit).collect();

    let ids: Vec<String> = top.iter().map(|(id, _)| id.clone()).collect();
    let items = self
      .store
      .get_mail_batch(&ids)
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    let by_id: HashMap<&str, &groundeffect_core::MailItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();

    let results: Vec<MailSummary> = top
      .iter()
      .filter_map(|(id, score)| {
        by_id.get(id.as_str()).map(|item| {
          let mut summary = MailSummary::from(*item);
          summary.score = Some(*score);
          summary
        })
      })
      .collect();

    info!(
      "mail search '{}' -> {} of {} candidates in {}ms",
      query,
      results.len(),
      total_count,
      start.elapsed().as_millis()
    );

    Ok(SearchResponse {
      results,
      accounts_searched,
      total_count,
      search_time_ms: start.elapsed().as_millis() as u64,
      degraded,
    })
  }

  pub async fn search_calendar(
    &self,
    query: &str,
    options: &CalendarSearchOptions,
  ) -> Result<SearchResponse<CalendarHit>> {
    let start = Instant::now();
    let limit = clamp_limit(options.limit)?;

    let accounts = self.resolve_accounts(options.accounts.as_deref()).await?;
    let filter = options.build_filter(accounts.as_deref());
    let accounts_searched = match &accounts {
      Some(list) => list.clone(),
      None => self.all_account_ids().await?,
    };

    if query.trim().is_empty() {
      let from = options.date_from.unwrap_or_else(|| Utc::now() - chrono::Duration::days(365));
      let to = options.date_to.unwrap_or_else(|| Utc::now() + chrono::Duration::days(365));
      let events = self
        .store
        .list_events_in_range(accounts.as_deref(), from, to, limit)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
      let total_count = events.len();
      return Ok(SearchResponse {
        results: events.into_iter().map(|event| CalendarHit { event, score: 0.0 }).collect(),
        accounts_searched,
        total_count,
        search_time_ms: start.elapsed().as_millis() as u64,
        degraded: false,
      });
    }

    let depth = candidate_depth(limit);
    let query_vector = self
      .embedder
      .embed(query)
      .await
      .map_err(|e| Error::Embedding(e.to_string()))?;

    let (keyword, vector) = tokio::join!(
      self.store.keyword_search(TableKind::Events, query, filter.as_deref(), depth),
      self
        .store
        .vector_search(TableKind::Events, &query_vector, filter.as_deref(), depth),
    );

    let vector = vector.map_err(|e| Error::Store(e.to_string()))?;
    let (keyword, degraded) = match keyword {
      Ok(hits) => (hits, false),
      Err(e) => {
        warn!("keyword side failed, degrading to vector-only: {}", e);
        (vec![], true)
      }
    };

    let fused = rrf_fuse(&keyword, &vector);
    let total_count = fused.len();
    let top: Vec<(String, f32)> = fused.into_iter().take(limit).collect();

    let ids: Vec<String> = top.iter().map(|(id, _)| id.clone()).collect();
    let events = self
      .store
      .get_events_batch(&ids)
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    let by_id: HashMap<&str, &CalendarItem> = events.iter().map(|e| (e.id.as_str(), e)).collect();

    let results: Vec<CalendarHit> = top
      .iter()
      .filter_map(|(id, score)| {
        by_id.get(id.as_str()).map(|event| CalendarHit {
          event: (*event).clone(),
          score: *score,
        })
      })
      .collect();

    debug!("calendar search '{}' -> {} results", query, results.len());

    Ok(SearchResponse {
      results,
      accounts_searched,
      total_count,
      search_time_ms: start.elapsed().as_millis() as u64,
      degraded,
    })
  }

  async fn all_account_ids(&self) -> Result<Vec<String>> {
    Ok(
      self
        .store
        .list_accounts()
        .await
        .map_err(|e| Error::Store(e.to_string()))?
        .into_iter()
        .map(|a| a.id)
        .collect(),
    )
  }

}

fn clamp_limit(limit: usize) -> Result<usize> {
  let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
  if limit > MAX_LIMIT {
    return Err(Error::BadRequest(format!("limit must be 1-{}", MAX_LIMIT)));
  }
  Ok(limit)
}

/// Reciprocal Rank Fusion over the two ranked lists. Ranks are 1-based;
/// a document absent from one side contributes nothing from it. Ties
/// break on document id so the ordering is total and reproducible.
pub fn rrf_fuse(keyword: &[(String, f32)], vector: &[(String, f32)]) -> Vec<(String, f32)> {
  let mut scores: HashMap<String, f32> = HashMap::new();

  for (rank, (id, _)) in keyword.iter().enumerate() {
    *scores.entry(id.clone()).or_default() += 1.0 / (RRF_K + rank as f32 + 1.0);
  }
  for (rank, (id, _)) in vector.iter().enumerate() {
    *scores.entry(id.clone()).or_default() += 1.0 / (RRF_K + rank as f32 + 1.0);
  }

  let mut fused: Vec<(String, f32)> = scores.into_iter().collect();
  fused.sort_by(|a, b| {
    b.1
      .partial_cmp(&a.1)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.0.cmp(&b.0))
  });
  fused
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hits(ids: &[&str]) -> Vec<(String, f32)> {
    ids.iter().enumerate().map(|(i, id)| (id.to_string(), 1.0 / (i as f32 + 1.0))).collect()
  }

  #[test]
  fn test_rrf_favors_agreement() {
    // "b" is mid-ranked on both sides; "a" and "c" top one side each.
    let keyword = hits(&["a", "b", "c"]);
    let vector = hits(&["c", "b", "a"]);

    let fused = rrf_fuse(&keyword, &vector);
    assert_eq!(fused.len(), 3);
    // a and c are symmetric (ranks 1+3), b holds 2+2; 1/61+1/63 > 2/62.
    assert_eq!(fused[0].0, "a");
    let score_a = fused[0].1;
    let score_b = fused.iter().find(|(id, _)| id == "b").unwrap().1;
    assert!(score_a > score_b);
  }

  #[test]
  fn test_rrf_deterministic_ordering() {
    let keyword = hits(&["m", "n", "o", "p"]);
    let vector = hits(&["p", "o", "n", "m"]);

    let first = rrf_fuse(&keyword, &vector);
    for _ in 0..10 {
      assert_eq!(rrf_fuse(&keyword, &vector), first);
    }
  }

  #[test]
  fn test_rrf_tie_breaks_on_id() {
    // Identical symmetric ranks: the id decides, ascending.
    let keyword = hits(&["z", "a"]);
    let vector = hits(&["a", "z"]);
    let fused = rrf_fuse(&keyword, &vector);
    assert_eq!(fused[0].0, "a");
    assert_eq!(fused[1].0, "z");
    assert_eq!(fused[0].1, fused[1].1);
  }

  #[test]
  fn test_rrf_single_side_membership() {
    let keyword = hits(&["only-keyword"]);
    let vector = hits(&["only-vector"]);
    let fused = rrf_fuse(&keyword, &vector);
    assert_eq!(fused.len(), 2);
    // Same rank on their one side each, so id ascending.
    assert_eq!(fused[0].0, "only-keyword");
  }

  #[test]
  fn test_candidate_depth_floor() {
    assert_eq!(candidate_depth(10), 100);
    assert_eq!(candidate_depth(25), 100);
    assert_eq!(candidate_depth(50), 200);
  }

  #[test]
  fn test_limit_clamp() {
    assert_eq!(clamp_limit(0).unwrap(), DEFAULT_LIMIT);
    assert_eq!(clamp_limit(5).unwrap(), 5);
    assert!(clamp_limit(101).is_err());
  }

  #[test]
  fn test_mail_filter_composition() {
    let options = MailSearchOptions {
      folder: Some("INBOX".into()),
      from: Some("pat".into()),
      date_from: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
      has_attachment: Some(true),
      ..Default::default()
    };
    let filter = options.build_filter(Some(&["a@x.test".to_string()])).unwrap();

    assert!(filter.contains("account_id IN ('a@x.test')"));
    assert!(filter.contains("folder = 'INBOX'"));
    assert!(filter.contains("from_email LIKE '%pat%'"));
    assert!(filter.contains("date >= 1700000000"));
    assert!(filter.contains("has_attachments = true"));
  }

  #[test]
  fn test_filter_quotes_single_quotes() {
    let options = MailSearchOptions {
      from: Some("o'hara".into()),
      ..Default::default()
    };
    let filter = options.build_filter(None).unwrap();
    assert!(filter.contains("o''hara"));
  }

  #[test]
  fn test_calendar_filter_uses_start_ts() {
    let options = CalendarSearchOptions {
      calendar_id: Some("primary".into()),
      date_from: Some(DateTime::from_timestamp(100, 0).unwrap()),
      date_to: Some(DateTime::from_timestamp(200, 0).unwrap()),
      ..Default::default()
    };
    let filter = options.build_filter(None).unwrap();
    assert!(filter.contains("calendar_id = 'primary'"));
    assert!(filter.contains("start_ts >= 100"));
    assert!(filter.contains("start_ts <= 200"));
  }
}
