//! In-memory provider fakes and a deterministic embedder.
//!
//! These stand in for Gmail and Google Calendar in tests: same traits,
//! no network. Mutating helpers let tests script server-side behaviour
//! (new mail, UIDVALIDITY rollovers, auth failures, IDLE pushes).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use embedding::{Embedder, EmbeddingError};
use groundeffect_core::{Address, CalendarItem, Error, MailItem, Result};

use crate::caldav::{CalendarAdapter, CalendarDelta, CalendarInfo};
use crate::imap::{EnvelopeSummary, FolderInfo, MailAdapter, MailboxEvent};

#[derive(Default)]
struct MockFolder {
  uid_validity: u32,
  messages: BTreeMap<u32, MailItem>,
}

/// Scriptable in-memory Gmail.
pub struct MockMailAdapter {
  account_id: String,
  folders: Mutex<HashMap<String, MockFolder>>,
  fail_auth: AtomicBool,
  fail_idle: AtomicBool,
  idle_notify: Notify,
  idle_pending: Mutex<VecDeque<String>>,
}

impl MockMailAdapter {
  pub fn new() -> Self {
    Self::for_account("a@x.test")
  }

  pub fn for_account(account_id: impl Into<String>) -> Self {
    Self {
      account_id: account_id.into(),
      folders: Mutex::new(HashMap::new()),
      fail_auth: AtomicBool::new(false),
      fail_idle: AtomicBool::new(false),
      idle_notify: Notify::new(),
      idle_pending: Mutex::new(VecDeque::new()),
    }
  }

  pub fn ensure_folder(&self, name: &str, uid_validity: u32) {
    let mut folders = self.folders.lock();
    let folder = folders.entry(name.to_string()).or_default();
    folder.uid_validity = uid_validity;
  }

  /// Insert a message; the item's uid keys it within the folder.
  pub fn add_message(&self, folder: &str, item: MailItem) {
    let mut folders = self.folders.lock();
    folders.entry(folder.to_string()).or_default().messages.insert(item.uid, item);
  }

  pub fn message_count(&self, folder: &str) -> usize {
    self.folders.lock().get(folder).map(|f| f.messages.len()).unwrap_or(0)
  }

  /// Simulate a UIDVALIDITY rollover: new epoch, every message renumbered
  /// by `offset`.
  pub fn rollover(&self, folder: &str, new_validity: u32, offset: u32) {
    let mut folders = self.folders.lock();
    if let Some(f) = folders.get_mut(folder) {
      f.uid_validity = new_validity;
      let renumbered: BTreeMap<u32, MailItem> = f
        .messages
        .values()
        .map(|item| {
          let mut item = item.clone();
          item.uid += offset;
          (item.uid, item)
        })
        .collect();
      f.messages = renumbered;
    }
  }

  pub fn remove_message(&self, folder: &str, uid: u32) {
    if let Some(f) = self.folders.lock().get_mut(folder) {
      f.messages.remove(&uid);
    }
  }

  pub fn set_fail_auth(&self, fail: bool) {
    self.fail_auth.store(fail, Ordering::SeqCst);
  }

  pub fn fail_idle(&self, fail: bool) {
    self.fail_idle.store(fail, Ordering::SeqCst);
    self.idle_notify.notify_waiters();
  }

  /// Push a server-side change notification to IDLE waiters.
  pub fn push_idle_change(&self, folder: &str) {
    self.idle_pending.lock().push_back(folder.to_string());
    self.idle_notify.notify_waiters();
  }

  fn check_auth(&self) -> Result<()> {
    if self.fail_auth.load(Ordering::SeqCst) {
      Err(Error::TokenExpired {
        account: self.account_id.clone(),
      })
    } else {
      Ok(())
    }
  }
}

impl Default for MockMailAdapter {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl MailAdapter for MockMailAdapter {
  async fn verify(&self) -> Result<()> {
    self.check_auth()
  }

  async fn list_folders(&self) -> Result<Vec<String>> {
    self.check_auth()?;
    let mut names: Vec<String> = self.folders.lock().keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  async fn select(&self, folder: &str) -> Result<FolderInfo> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    Ok(FolderInfo {
      name: folder.to_string(),
      uid_validity: f.uid_validity,
      exists: f.messages.len() as u32,
    })
  }

  async fn search_since(&self, folder: &str, since: DateTime<Utc>, before: Option<DateTime<Utc>>) -> Result<Vec<u32>> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    let mut uids: Vec<u32> = f
      .messages
      .values()
      .filter(|m| m.date >= since && before.map(|b| m.date < b).unwrap_or(true))
      .map(|m| m.uid)
      .collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn search_unread_or_flagged(&self, folder: &str) -> Result<Vec<u32>> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    let mut uids: Vec<u32> = f
      .messages
      .values()
      .filter(|m| !m.is_read() || m.is_flagged())
      .map(|m| m.uid)
      .collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn search_after(&self, folder: &str, after_uid: u32) -> Result<Vec<u32>> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    let mut uids: Vec<u32> = f.messages.keys().copied().filter(|&u| u > after_uid).collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn fetch_envelopes(&self, folder: &str, uids: &[u32]) -> Result<Vec<EnvelopeSummary>> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    Ok(
      uids
        .iter()
        .filter_map(|uid| f.messages.get(uid))
        .map(|m| EnvelopeSummary {
          uid: m.uid,
          size: m.raw_size,
          flags: m.flags.clone(),
        })
        .collect(),
    )
  }

  async fn fetch_bodies(&self, folder: &str, uids: &[u32]) -> Result<Vec<MailItem>> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let f = folders
      .get(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    let mut items: Vec<MailItem> = uids
      .iter()
      .filter_map(|uid| f.messages.get(uid))
      .map(|m| {
        let mut item = m.clone();
        item.uid_validity = f.uid_validity;
        item.folder = folder.to_string();
        item.synced_at = Utc::now();
        item
      })
      .collect();
    items.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(items)
  }

  async fn idle(&self, folder: &str) -> Result<MailboxEvent> {
    if self.fail_idle.load(Ordering::SeqCst) {
      return Err(Error::Imap("idle connection dropped".into()));
    }
    loop {
      {
        let mut pending = self.idle_pending.lock();
        if let Some(position) = pending.iter().position(|f| f == folder) {
          pending.remove(position);
          return Ok(MailboxEvent::Changed);
        }
      }
      self.idle_notify.notified().await;
      if self.fail_idle.load(Ordering::SeqCst) {
        return Err(Error::Imap("idle connection dropped".into()));
      }
    }
  }

  async fn store_flags(&self, folder: &str, uid: u32, add: &[String], remove: &[String]) -> Result<()> {
    self.check_auth()?;
    let mut folders = self.folders.lock();
    let f = folders
      .get_mut(folder)
      .ok_or_else(|| Error::Imap(format!("no such folder {}", folder)))?;
    let message = f
      .messages
      .get_mut(&uid)
      .ok_or_else(|| Error::MailNotFound(format!("uid {}", uid)))?;
    for flag in add {
      if !message.flags.contains(flag) {
        message.flags.push(flag.clone());
      }
    }
    message.flags.retain(|flag| !remove.contains(flag));
    Ok(())
  }

  async fn copy_message(&self, folder: &str, uid: u32, destination: &str) -> Result<()> {
    self.check_auth()?;
    let mut folders = self.folders.lock();
    let item = folders
      .get(folder)
      .and_then(|f| f.messages.get(&uid))
      .cloned()
      .ok_or_else(|| Error::MailNotFound(format!("uid {}", uid)))?;
    folders.entry(destination.to_string()).or_default().messages.insert(uid, item);
    Ok(())
  }

  async fn delete_message(&self, folder: &str, uid: u32) -> Result<()> {
    self.check_auth()?;
    self.remove_message(folder, uid);
    Ok(())
  }

  async fn fetch_attachment(&self, folder: &str, uid: u32, filename: &str) -> Result<(Vec<u8>, String)> {
    self.check_auth()?;
    let folders = self.folders.lock();
    let message = folders
      .get(folder)
      .and_then(|f| f.messages.get(&uid))
      .ok_or_else(|| Error::MailNotFound(format!("uid {}", uid)))?;
    message
      .attachments
      .iter()
      .find(|a| a.filename == filename)
      .map(|a| (format!("contents of {}", a.filename).into_bytes(), a.mime_type.clone()))
      .ok_or_else(|| Error::MailNotFound(format!("attachment {}", filename)))
  }
}

/// Scriptable in-memory Google Calendar.
pub struct MockCalendarAdapter {
  account_id: String,
  events: Mutex<HashMap<String, CalendarItem>>,
  pending_deletes: Mutex<Vec<String>>,
  token_counter: AtomicU64,
  fail_auth: AtomicBool,
}

impl MockCalendarAdapter {
  pub fn new() -> Self {
    Self::for_account("a@x.test")
  }

  pub fn for_account(account_id: impl Into<String>) -> Self {
    Self {
      account_id: account_id.into(),
      events: Mutex::new(HashMap::new()),
      pending_deletes: Mutex::new(Vec::new()),
      token_counter: AtomicU64::new(0),
      fail_auth: AtomicBool::new(false),
    }
  }

  pub fn add_event(&self, item: CalendarItem) {
    self.events.lock().insert(item.provider_event_id.clone(), item);
  }

  pub fn remove_event(&self, provider_event_id: &str) {
    if self.events.lock().remove(provider_event_id).is_some() {
      self.pending_deletes.lock().push(provider_event_id.to_string());
    }
  }

  pub fn set_fail_auth(&self, fail: bool) {
    self.fail_auth.store(fail, Ordering::SeqCst);
  }

  fn check_auth(&self) -> Result<()> {
    if self.fail_auth.load(Ordering::SeqCst) {
      Err(Error::TokenExpired {
        account: self.account_id.clone(),
      })
    } else {
      Ok(())
    }
  }
}

impl Default for MockCalendarAdapter {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl CalendarAdapter for MockCalendarAdapter {
  async fn verify(&self) -> Result<()> {
    self.check_auth()
  }

  async fn list_calendars(&self) -> Result<Vec<CalendarInfo>> {
    self.check_auth()?;
    Ok(vec![CalendarInfo {
      id: "primary".into(),
      summary: "Primary".into(),
      primary: true,
    }])
  }

  async fn delta(
    &self,
    calendar_id: &str,
    _sync_token: Option<&str>,
    _window_start: Option<DateTime<Utc>>,
  ) -> Result<CalendarDelta> {
    self.check_auth()?;
    let token = self.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let changed: Vec<CalendarItem> = self
      .events
      .lock()
      .values()
      .map(|e| {
        let mut event = e.clone();
        event.calendar_id = calendar_id.to_string();
        event
      })
      .collect();
    let deleted = std::mem::take(&mut *self.pending_deletes.lock());
    Ok(CalendarDelta {
      changed,
      deleted,
      next_sync_token: Some(format!("tok-{}", token)),
    })
  }

  async fn fetch_event(&self, _calendar_id: &str, provider_event_id: &str) -> Result<Option<CalendarItem>> {
    self.check_auth()?;
    Ok(self.events.lock().get(provider_event_id).cloned())
  }

  async fn create_event(&self, item: &CalendarItem) -> Result<(String, String)> {
    self.check_auth()?;
    let id = format!("ev-{}", self.token_counter.fetch_add(1, Ordering::SeqCst) + 1);
    let etag = "\"1\"".to_string();
    let mut created = item.clone();
    created.provider_event_id = id.clone();
    created.etag = etag.clone();
    self.events.lock().insert(id.clone(), created);
    Ok((id, etag))
  }

  async fn update_event(&self, item: &CalendarItem) -> Result<String> {
    self.check_auth()?;
    let mut events = self.events.lock();
    let existing = events
      .get_mut(&item.provider_event_id)
      .ok_or_else(|| Error::EventNotFound(item.provider_event_id.clone()))?;
    let bumped = existing.etag.trim_matches('"').parse::<u64>().unwrap_or(1) + 1;
    let etag = format!("\"{}\"", bumped);
    *existing = item.clone();
    existing.etag = etag.clone();
    Ok(etag)
  }

  async fn delete_event(&self, _calendar_id: &str, provider_event_id: &str) -> Result<()> {
    self.check_auth()?;
    self.remove_event(provider_event_id);
    Ok(())
  }
}

/// Deterministic embedder: same text, same unit vector. No model, no
/// network, honours the 768-width contract.
pub struct FakeEmbedder {
  fail: AtomicBool,
}

impl FakeEmbedder {
  pub fn new() -> Self {
    Self {
      fail: AtomicBool::new(false),
    }
  }

  pub fn set_fail(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  fn vector_for(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 768];
    // Spread character evidence over the space so distinct texts land in
    // distinct directions.
    for (i, b) in text.bytes().enumerate() {
      v[(b as usize * 31 + i) % 768] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
    v.iter_mut().for_each(|x| *x /= norm);
    v
  }
}

impl Default for FakeEmbedder {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Embedder for FakeEmbedder {
  fn model_id(&self) -> &str {
    "fake-embedder"
  }

  fn dimensions(&self) -> usize {
    768
  }

  async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(EmbeddingError::Inference("forced failure".into()));
    }
    Ok(Self::vector_for(text))
  }

  async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(EmbeddingError::Inference("forced failure".into()));
    }
    Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
  }
}

/// A plain mail item for fixtures.
pub fn mail_fixture(account_id: &str, message_id: &str, uid: u32, date: DateTime<Utc>) -> MailItem {
  MailItem {
    id: MailItem::stable_id(account_id, message_id),
    account_id: account_id.to_string(),
    account_alias: None,
    message_id: message_id.to_string(),
    provider_message_id: uid as u64,
    thread_id: uid as u64,
    uid,
    uid_validity: 1,
    in_reply_to: None,
    references: vec![],
    folder: "INBOX".into(),
    labels: vec![],
    flags: vec!["\\Seen".into()],
    from: Address::with_name("Pat", "pat@z.test"),
    to: vec![Address::new(account_id)],
    cc: vec![],
    bcc: vec![],
    subject: format!("message {}", uid),
    date,
    body_plain: format!("body of message {}", uid),
    body_html: None,
    snippet: String::new(),
    attachments: vec![],
    embedding: None,
    needs_embedding: true,
    synced_at: date,
    raw_size: 512,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_fake_embedder_is_deterministic_and_normalised() {
    let embedder = FakeEmbedder::new();
    let a = embedder.embed("hello world").await.unwrap();
    let b = embedder.embed("hello world").await.unwrap();
    let c = embedder.embed("goodbye").await.unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 768);
    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }

  #[tokio::test]
  async fn test_mock_mail_search_filters() {
    let adapter = MockMailAdapter::new();
    adapter.ensure_folder("INBOX", 1);

    let now = Utc::now();
    adapter.add_message("INBOX", mail_fixture("a@x.test", "<recent@x>", 10, now - chrono::Duration::days(5)));
    adapter.add_message("INBOX", mail_fixture("a@x.test", "<old@x>", 5, now - chrono::Duration::days(200)));
    let mut unread = mail_fixture("a@x.test", "<unread@x>", 3, now - chrono::Duration::days(300));
    unread.flags.clear();
    adapter.add_message("INBOX", unread);

    let recent = adapter
      .search_since("INBOX", now - chrono::Duration::days(90), None)
      .await
      .unwrap();
    assert_eq!(recent, vec![10]);

    let special = adapter.search_unread_or_flagged("INBOX").await.unwrap();
    assert_eq!(special, vec![3]);

    let after = adapter.search_after("INBOX", 4).await.unwrap();
    assert_eq!(after, vec![10, 5]);
  }

  #[tokio::test]
  async fn test_mock_rollover_renumbers() {
    let adapter = MockMailAdapter::new();
    adapter.ensure_folder("INBOX", 1);
    adapter.add_message("INBOX", mail_fixture("a@x.test", "<m@x>", 7, Utc::now()));

    adapter.rollover("INBOX", 2, 1000);
    let info = adapter.select("INBOX").await.unwrap();
    assert_eq!(info.uid_validity, 2);

    let items = adapter.fetch_bodies("INBOX", &[1007]).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].uid_validity, 2);
    assert_eq!(items[0].message_id, "<m@x>");
  }

  #[tokio::test]
  async fn test_mock_calendar_delta_tokens_advance() {
    let adapter = MockCalendarAdapter::new();
    let first = adapter.delta("primary", None, None).await.unwrap();
    let second = adapter.delta("primary", first.next_sync_token.as_deref(), None).await.unwrap();
    assert_ne!(first.next_sync_token, second.next_sync_token);
  }
}
