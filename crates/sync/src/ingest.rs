//! Ingest pipeline: normalise, extract text, snippet, cap, embed,
//! enqueue for commit.
//!
//! Embedding failure is non-fatal here: the affected items commit with a
//! zero vector and `needs_embedding` set, and a daemon sweep retries
//! them later. The pipeline awaits the store commit so callers know when
//! their batch is visible.

use std::sync::Arc;
use tracing::{debug, warn};

use embedding::Embedder;
use groundeffect_core::{CalendarItem, MailItem, Result};
use store::{WriteOp, WriterHandle};

/// Items per embed_batch call; bounded so one giant fetch cannot wedge
/// the embedder queue.
const EMBED_CHUNK: usize = 32;

pub struct IngestPipeline {
  embedder: Arc<dyn Embedder>,
  writer: WriterHandle,
  body_max_chars: usize,
}

impl IngestPipeline {
  pub fn new(embedder: Arc<dyn Embedder>, writer: WriterHandle, body_max_chars: usize) -> Self {
    Self {
      embedder,
      writer,
      body_max_chars,
    }
  }

  /// Normalise, embed, and commit mail items. Returns once the batch is
  /// durable in the store.
  pub async fn process_mail(&self, mut items: Vec<MailItem>, account_alias: Option<&str>) -> Result<usize> {
    if items.is_empty() {
      return Ok(0);
    }

    for item in &mut items {
      item.account_alias = account_alias.map(|s| s.to_string());
      normalise_mail(item, self.body_max_chars);
    }

    for chunk in items.chunks_mut(EMBED_CHUNK) {
      let texts: Vec<String> = chunk.iter().map(|m| m.searchable_text()).collect();
      match self.embedder.embed_batch(&texts).await {
        Ok(vectors) => {
          for (item, vector) in chunk.iter_mut().zip(vectors) {
            item.embedding = Some(vector);
            item.needs_embedding = false;
          }
        }
        Err(e) => {
          // Commit anyway; the zero vector is replaced by the re-embed pass.
          warn!("embedding failed for {} mail items: {}", chunk.len(), e);
          for item in chunk.iter_mut() {
            item.embedding = None;
            item.needs_embedding = true;
          }
        }
      }
    }

    let count = items.len();
    self
      .writer
      .submit_and_wait(WriteOp::UpsertMail(items))
      .await
      .map_err(|e| groundeffect_core::Error::Store(e.to_string()))?;
    debug!("ingested {} mail items", count);
    Ok(count)
  }

  /// Normalise, embed, and commit calendar items.
  pub async fn process_events(&self, mut items: Vec<CalendarItem>, account_alias: Option<&str>) -> Result<usize> {
    if items.is_empty() {
      return Ok(0);
    }

    for item in &mut items {
      item.account_alias = account_alias.map(|s| s.to_string());
      if let Some(description) = &item.description {
        if description.len() > self.body_max_chars {
          item.description = Some(truncate_chars(description, self.body_max_chars).0);
        }
      }
    }

    for chunk in items.chunks_mut(EMBED_CHUNK) {
      let texts: Vec<String> = chunk.iter().map(|e| e.searchable_text()).collect();
      match self.embedder.embed_batch(&texts).await {
        Ok(vectors) => {
          for (item, vector) in chunk.iter_mut().zip(vectors) {
            item.embedding = Some(vector);
            item.needs_embedding = false;
          }
        }
        Err(e) => {
          warn!("embedding failed for {} events: {}", chunk.len(), e);
          for item in chunk.iter_mut() {
            item.embedding = None;
            item.needs_embedding = true;
          }
        }
      }
    }

    let count = items.len();
    self
      .writer
      .submit_and_wait(WriteOp::UpsertEvents(items))
      .await
      .map_err(|e| groundeffect_core::Error::Store(e.to_string()))?;
    debug!("ingested {} events", count);
    Ok(count)
  }
}

fn normalise_mail(item: &mut MailItem, body_max_chars: usize) {
  // Messages with only an HTML part still need searchable text.
  if item.body_plain.trim().is_empty() {
    if let Some(html) = &item.body_html {
      item.body_plain = strip_html(html);
    }
  }

  let (capped, truncated) = truncate_chars(&item.body_plain, body_max_chars);
  if truncated {
    item.body_plain = capped;
  }

  if item.snippet.is_empty() {
    item.snippet = item.body_plain.chars().take(200).collect();
  } else if item.snippet.chars().count() > 200 {
    item.snippet = item.snippet.chars().take(200).collect();
  }
}

/// Cap a string at `max` characters; returns whether it was cut.
pub fn truncate_chars(s: &str, max: usize) -> (String, bool) {
  if s.chars().count() <= max {
    (s.to_string(), false)
  } else {
    (s.chars().take(max).collect(), true)
  }
}

/// Minimal HTML-to-text fallback: drops tags, skips script/style
/// content, decodes the common entities. The full converter is an
/// external collaborator; this keeps HTML-only mail searchable.
pub fn strip_html(html: &str) -> String {
  // ASCII-case-insensitive byte search, safe on any UTF-8 input.
  fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
      return None;
    }
    haystack[from..]
      .windows(needle.len())
      .position(|window| window.eq_ignore_ascii_case(needle))
      .map(|offset| from + offset)
  }

  let bytes = html.as_bytes();
  let mut out = String::with_capacity(html.len() / 2);
  let mut chars = html.char_indices();

  while let Some((i, c)) = chars.next() {
    if c == '<' {
      let rest = &bytes[i..];
      let mut skipped_block = false;
      for (open, close) in [(b"<script".as_slice(), b"</script>".as_slice()), (b"<style", b"</style>")] {
        if rest.len() >= open.len() && rest[..open.len()].eq_ignore_ascii_case(open) {
          let end = find_ci(bytes, close, i).map(|p| p + close.len()).unwrap_or(html.len());
          while let Some((j, _)) = chars.next() {
            if j + 1 >= end {
              break;
            }
          }
          skipped_block = true;
          break;
        }
      }
      if skipped_block {
        continue;
      }

      // Consume through the closing '>'
      let mut end = html.len();
      for (j, d) in chars.by_ref() {
        if d == '>' {
          end = j;
          break;
        }
      }
      let tag = &bytes[i..end.min(bytes.len())];
      for block in [b"<br".as_slice(), b"<p", b"<div", b"<tr"] {
        if tag.len() >= block.len() && tag[..block.len()].eq_ignore_ascii_case(block) {
          out.push('\n');
          break;
        }
      }
      continue;
    }
    out.push(c);
  }

  let decoded = out
    .replace("&nbsp;", " ")
    .replace("&amp;", "&")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&quot;", "\"")
    .replace("&#39;", "'");

  // Collapse whitespace runs left behind by markup.
  let mut collapsed = String::with_capacity(decoded.len());
  let mut last_was_space = false;
  for c in decoded.chars() {
    if c == ' ' || c == '\t' {
      if !last_was_space {
        collapsed.push(' ');
      }
      last_was_space = true;
    } else {
      if c == '\n' {
        while collapsed.ends_with(' ') {
          collapsed.pop();
        }
      }
      collapsed.push(c);
      last_was_space = false;
    }
  }
  collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use groundeffect_core::Address;

  fn item(body_plain: &str, body_html: Option<&str>) -> MailItem {
    MailItem {
      id: "a@x.test:<m1@x>".into(),
      account_id: "a@x.test".into(),
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
      body_plain: body_plain.into(),
      body_html: body_html.map(|s| s.to_string()),
      snippet: String::new(),
      attachments: vec![],
      embedding: None,
      needs_embedding: true,
      synced_at: Utc::now(),
      raw_size: 1,
    }
  }

  #[test]
  fn test_strip_html_basic() {
    let text = strip_html("<html><body><p>Hello <b>world</b></p><br>bye</body></html>");
    assert!(text.contains("Hello world"));
    assert!(text.contains("bye"));
    assert!(!text.contains('<'));
  }

  #[test]
  fn test_strip_html_skips_script_and_style() {
    let text = strip_html("<style>p{color:red}</style><p>visible</p><script>alert(1)</script>");
    assert_eq!(text, "visible");
  }

  #[test]
  fn test_strip_html_decodes_entities() {
    assert_eq!(strip_html("a &amp; b &lt;c&gt;"), "a & b <c>");
  }

  #[test]
  fn test_normalise_extracts_text_from_html_only_mail() {
    let mut mail = item("", Some("<p>only html body</p>"));
    normalise_mail(&mut mail, 40_000);
    assert_eq!(mail.body_plain, "only html body");
    assert_eq!(mail.snippet, "only html body");
  }

  #[test]
  fn test_normalise_caps_body() {
    let long = "x".repeat(50_000);
    let mut mail = item(&long, None);
    normalise_mail(&mut mail, 40_000);
    assert_eq!(mail.body_plain.chars().count(), 40_000);
  }

  #[test]
  fn test_snippet_bounded_at_200() {
    let mut mail = item(&"word ".repeat(100), None);
    normalise_mail(&mut mail, 40_000);
    assert_eq!(mail.snippet.chars().count(), 200);
  }

  #[test]
  fn test_truncate_chars() {
    assert_eq!(truncate_chars("short", 10), ("short".to_string(), false));
    assert_eq!(truncate_chars("longer text", 6), ("longer".to_string(), true));
  }
}
