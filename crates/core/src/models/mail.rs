use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Attachment, AttachmentSummary};

/// Mailbox address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub email: String,
}

impl Address {
  pub fn new(email: impl Into<String>) -> Self {
    Self {
      name: None,
      email: email.into(),
    }
  }

  pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
    Self {
      name: Some(name.into()),
      email: email.into(),
    }
  }

  /// Case-insensitive substring match against name or address, used by
  /// the sender/recipient filters.
  pub fn contains(&self, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    self.email.to_lowercase().contains(&needle)
      || self
        .name
        .as_ref()
        .map(|n| n.to_lowercase().contains(&needle))
        .unwrap_or(false)
  }
}

impl std::fmt::Display for Address {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.name {
      Some(name) => write!(f, "{} <{}>", name, self.email),
      None => write!(f, "{}", self.email),
    }
  }
}

/// A synced mail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailItem {
  /// Internal id, stable across re-syncs: `<account>:<message_id>`
  pub id: String,

  pub account_id: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub account_alias: Option<String>,

  /// RFC 5322 Message-ID
  pub message_id: String,

  /// Provider message id (X-GM-MSGID)
  pub provider_message_id: u64,

  /// Provider thread id (X-GM-THRID)
  pub thread_id: u64,

  /// IMAP UID within the folder
  pub uid: u32,

  /// UIDVALIDITY epoch the UID belongs to; a new epoch invalidates
  /// every UID in the folder
  pub uid_validity: u32,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub in_reply_to: Option<String>,

  /// References header chain, threading fallback when thread_id is absent
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub references: Vec<String>,

  pub folder: String,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub labels: Vec<String>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub flags: Vec<String>,

  pub from: Address,

  #[serde(default)]
  pub to: Vec<Address>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub cc: Vec<Address>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub bcc: Vec<Address>,

  pub subject: String,

  pub date: DateTime<Utc>,

  pub body_plain: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub body_html: Option<String>,

  /// Preview, at most 200 chars
  pub snippet: String,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub attachments: Vec<Attachment>,

  /// 768-dim unit vector; skipped on the wire
  #[serde(skip)]
  pub embedding: Option<Vec<f32>>,

  /// Set when the embedder failed and the row carries a zero vector
  #[serde(default)]
  pub needs_embedding: bool,

  pub synced_at: DateTime<Utc>,

  pub raw_size: u64,
}

impl MailItem {
  /// Stable internal id. Keyed on Message-ID so duplicate deliveries
  /// collapse to one row.
  pub fn stable_id(account_id: &str, message_id: &str) -> String {
    format!("{}:{}", account_id, message_id)
  }

  pub fn is_read(&self) -> bool {
    self.flags.iter().any(|f| f == "\\Seen")
  }

  pub fn is_flagged(&self) -> bool {
    self.flags.iter().any(|f| f == "\\Flagged")
  }

  pub fn has_attachments(&self) -> bool {
    !self.attachments.is_empty()
  }

  /// Text fed to the embedder. Subject is doubled so it outweighs body
  /// content, matching the keyword index's field weighting.
  pub fn searchable_text(&self) -> String {
    let mut text = String::with_capacity(self.body_plain.len() + 256);
    text.push_str(&self.subject);
    text.push_str(". ");
    text.push_str(&self.subject);
    text.push_str(". From: ");
    text.push_str(&self.from.to_string());
    text.push_str(". ");
    text.push_str(&self.body_plain);
    if !self.attachments.is_empty() {
      text.push_str(" Attachments:");
      for att in &self.attachments {
        text.push(' ');
        text.push_str(&att.filename);
      }
    }
    text
  }
}

/// The stable result envelope for mail items (spec'd field names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSummary {
  pub id: String,
  pub account_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub account_alias: Option<String>,
  pub message_id: String,
  pub thread_id: String,
  pub from: Address,
  pub to: Vec<Address>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cc: Option<Vec<Address>>,
  pub subject: String,
  /// ISO-8601 UTC
  pub date: DateTime<Utc>,
  pub snippet: String,
  pub has_attachments: bool,
  pub attachments: Vec<AttachmentSummary>,
  pub labels: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub score: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub truncated: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub total_body_chars: Option<usize>,
}

impl From<&MailItem> for MailSummary {
  fn from(item: &MailItem) -> Self {
    Self {
      id: item.id.clone(),
      account_id: item.account_id.clone(),
      account_alias: item.account_alias.clone(),
      message_id: item.message_id.clone(),
      thread_id: item.thread_id.to_string(),
      from: item.from.clone(),
      to: item.to.clone(),
      cc: if item.cc.is_empty() { None } else { Some(item.cc.clone()) },
      subject: item.subject.clone(),
      date: item.date,
      snippet: item.snippet.clone(),
      has_attachments: item.has_attachments(),
      attachments: item.attachments.iter().map(AttachmentSummary::from).collect(),
      labels: item.labels.clone(),
      score: None,
      truncated: None,
      total_body_chars: None,
    }
  }
}

/// Outbound mail request handled by the mutation router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMailRequest {
  /// Sending account, email or alias
  pub from_account: String,
  pub to: Vec<String>,
  pub subject: String,
  pub body: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub cc: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub bcc: Vec<String>,
  /// Internal id of the message being replied to, for threading headers
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reply_to_id: Option<String>,
  /// Without this the router returns a preview and performs no call
  #[serde(default)]
  pub confirm: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item() -> MailItem {
    MailItem {
      id: MailItem::stable_id("a@x.test", "<m1@x>"),
      account_id: "a@x.test".into(),
      account_alias: None,
      message_id: "<m1@x>".into(),
      provider_message_id: 11,
      thread_id: 7,
      uid: 101,
      uid_validity: 1,
      in_reply_to: None,
      references: vec![],
      folder: "INBOX".into(),
      labels: vec!["\\Inbox".into()],
      flags: vec!["\\Seen".into()],
      from: Address::with_name("Pat", "pat@z.test"),
      to: vec![Address::new("a@x.test")],
      cc: vec![],
      bcc: vec![],
      subject: "Invoice for March".into(),
      date: Utc::now(),
      body_plain: "Please find the invoice attached.".into(),
      body_html: None,
      snippet: "Please find the invoice attached.".into(),
      attachments: vec![Attachment::new("att1", "invoice.pdf", "application/pdf", 1024)],
      embedding: None,
      needs_embedding: false,
      synced_at: Utc::now(),
      raw_size: 2048,
    }
  }

  #[test]
  fn test_stable_id_collapses_duplicates() {
    assert_eq!(
      MailItem::stable_id("a@x.test", "<m1@x>"),
      MailItem::stable_id("a@x.test", "<m1@x>")
    );
    assert_ne!(
      MailItem::stable_id("a@x.test", "<m1@x>"),
      MailItem::stable_id("b@y.test", "<m1@x>")
    );
  }

  #[test]
  fn test_flags() {
    let item = item();
    assert!(item.is_read());
    assert!(!item.is_flagged());
    assert!(item.has_attachments());
  }

  #[test]
  fn test_searchable_text_weights_subject_and_names_attachments() {
    let text = item().searchable_text();
    assert_eq!(text.matches("Invoice for March").count(), 2);
    assert!(text.contains("pat@z.test"));
    assert!(text.contains("invoice.pdf"));
  }

  #[test]
  fn test_address_contains() {
    let addr = Address::with_name("Pat Smith", "pat@z.test");
    assert!(addr.contains("pat"));
    assert!(addr.contains("SMITH"));
    assert!(addr.contains("z.test"));
    assert!(!addr.contains("quinn"));
  }

  #[test]
  fn test_summary_envelope_fields() {
    let summary = MailSummary::from(&item());
    assert_eq!(summary.thread_id, "7");
    assert!(summary.has_attachments);
    assert!(summary.cc.is_none());
    let json = serde_json::to_value(&summary).unwrap();
    assert!(json.get("score").is_none());
    assert_eq!(json["account_id"], "a@x.test");
  }
}
