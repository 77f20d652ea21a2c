use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An attachment referenced by a mail item. Content is fetched lazily;
/// `local_path` is set once the bytes land on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
  pub id: String,
  pub filename: String,
  pub mime_type: String,
  pub size: u64,

  /// MIME Content-ID for inline parts
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_id: Option<String>,

  /// Where the downloaded bytes live, if downloaded
  #[serde(skip_serializing_if = "Option::is_none")]
  pub local_path: Option<PathBuf>,
}

impl Attachment {
  pub fn new(id: impl Into<String>, filename: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
    Self {
      id: id.into(),
      filename: filename.into(),
      mime_type: mime_type.into(),
      size,
      content_id: None,
      local_path: None,
    }
  }

  pub fn downloaded(&self) -> bool {
    self.local_path.is_some()
  }

  /// Human-readable size for result envelopes.
  pub fn size_human(&self) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    match self.size {
      s if s >= MB => format!("{:.1} MB", s as f64 / MB as f64),
      s if s >= KB => format!("{:.1} KB", s as f64 / KB as f64),
      s => format!("{} B", s),
    }
  }
}

/// Lightweight attachment info carried in search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSummary {
  pub id: String,
  pub filename: String,
  pub mime_type: String,
  pub size_human: String,
  pub downloaded: bool,
}

impl From<&Attachment> for AttachmentSummary {
  fn from(a: &Attachment) -> Self {
    Self {
      id: a.id.clone(),
      filename: a.filename.clone(),
      mime_type: a.mime_type.clone(),
      size_human: a.size_human(),
      downloaded: a.downloaded(),
    }
  }
}
