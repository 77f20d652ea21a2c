//! Gmail IMAP adapter.
//!
//! The orchestrator talks to the `MailAdapter` capability trait; this
//! module provides the Gmail implementation over async-imap with
//! XOAUTH2. Connections are short-lived (one per operation) and the
//! per-account control-channel permit keeps a single command stream in
//! use at a time. UIDVALIDITY is surfaced on every select so the
//! orchestrator can detect epoch rollovers.

use async_imap::types::Flag;
use async_imap::{Authenticator, Client as ImapClient};
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mail_parser::MimeHeaders;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use groundeffect_core::{Address, Attachment, Error, MailItem, Result, TokenManager, xoauth2_string};

use crate::rate_limit::RateLimiter;

const IMAP_HOST: &str = "imap.gmail.com";
const IMAP_PORT: u16 = 993;
const MAX_CONNECT_RETRIES: u32 = 3;
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Gmail drops IDLE at 30 minutes; re-issue just under that.
const IDLE_WINDOW: Duration = Duration::from_secs(29 * 60);

/// Folder metadata captured at select time.
#[derive(Debug, Clone)]
pub struct FolderInfo {
  pub name: String,
  pub uid_validity: u32,
  pub exists: u32,
}

/// Envelope-only view used to plan body fetches.
#[derive(Debug, Clone)]
pub struct EnvelopeSummary {
  pub uid: u32,
  pub size: u64,
  pub flags: Vec<String>,
}

/// What an IDLE wait produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
  /// Server pushed a change
  Changed,
  /// The IDLE window elapsed quietly
  Timeout,
}

/// Mail provider capability. Tests substitute an in-memory fake.
#[async_trait]
pub trait MailAdapter: Send + Sync {
  /// Probe authentication; an auth-class error here parks the account.
  async fn verify(&self) -> Result<()>;

  async fn list_folders(&self) -> Result<Vec<String>>;

  /// Select a folder, returning its current UIDVALIDITY and size.
  async fn select(&self, folder: &str) -> Result<FolderInfo>;

  /// UIDs at or after `since` (and before `before` when given),
  /// descending, so newest work schedules first.
  async fn search_since(&self, folder: &str, since: DateTime<Utc>, before: Option<DateTime<Utc>>) -> Result<Vec<u32>>;

  /// Unread or flagged UIDs regardless of age.
  async fn search_unread_or_flagged(&self, folder: &str) -> Result<Vec<u32>>;

  /// UIDs strictly above a watermark, descending. Drives the
  /// IDLE-triggered incremental fetch.
  async fn search_after(&self, folder: &str, after_uid: u32) -> Result<Vec<u32>>;

  /// Envelope pass over a UID range (no bodies).
  async fn fetch_envelopes(&self, folder: &str, uids: &[u32]) -> Result<Vec<EnvelopeSummary>>;

  /// Full messages for grouped UIDs, one round trip including the
  /// provider threading extensions.
  async fn fetch_bodies(&self, folder: &str, uids: &[u32]) -> Result<Vec<MailItem>>;

  /// Block inside one IDLE window until the server pushes or it lapses.
  async fn idle(&self, folder: &str) -> Result<MailboxEvent>;

  async fn store_flags(&self, folder: &str, uid: u32, add: &[String], remove: &[String]) -> Result<()>;

  async fn copy_message(&self, folder: &str, uid: u32, destination: &str) -> Result<()>;

  /// Flag deleted and expunge.
  async fn delete_message(&self, folder: &str, uid: u32) -> Result<()>;

  /// Download one attachment's bytes and MIME type.
  async fn fetch_attachment(&self, folder: &str, uid: u32, filename: &str) -> Result<(Vec<u8>, String)>;
}

struct XOAuth2 {
  auth_string: String,
}

impl Authenticator for XOAuth2 {
  type Response = String;

  fn process(&mut self, _challenge: &[u8]) -> Self::Response {
    std::mem::take(&mut self.auth_string)
  }
}

type Session = async_imap::Session<async_native_tls::TlsStream<tokio_util::compat::Compat<TcpStream>>>;

pub struct GmailImap {
  account_id: String,
  tokens: Arc<TokenManager>,
  limiter: Arc<RateLimiter>,
}

impl GmailImap {
  pub fn new(account_id: impl Into<String>, tokens: Arc<TokenManager>, limiter: Arc<RateLimiter>) -> Self {
    Self {
      account_id: account_id.into(),
      tokens,
      limiter,
    }
  }

  async fn connect(&self) -> Result<Session> {
    self.limiter.acquire_for(&self.account_id).await?;

    let tcp = TcpStream::connect((IMAP_HOST, IMAP_PORT))
      .await
      .map_err(|e| Error::ConnectionFailed {
        host: IMAP_HOST.to_string(),
        reason: e.to_string(),
      })?;

    let tls = TlsConnector::new();
    let tls_stream = tls
      .connect(IMAP_HOST, tcp.compat())
      .await
      .map_err(|e| Error::ConnectionFailed {
        host: IMAP_HOST.to_string(),
        reason: e.to_string(),
      })?;

    let mut client = ImapClient::new(tls_stream);

    // Gmail greets before accepting commands; the greeting must be
    // consumed prior to AUTHENTICATE.
    match client.read_response().await {
      Some(Ok(_)) => {}
      Some(Err(e)) => return Err(Error::Imap(format!("greeting: {:?}", e))),
      None => return Err(Error::Imap("connection closed before greeting".into())),
    }

    let access_token = self.tokens.get_valid_token(&self.account_id).await?;
    let auth = XOAuth2 {
      auth_string: xoauth2_string(&self.account_id, &access_token),
    };

    let session = tokio::time::timeout(AUTH_TIMEOUT, client.authenticate("XOAUTH2", auth))
      .await
      .map_err(|_| Error::Imap("XOAUTH2 authentication timed out".into()))?
      .map_err(|(e, _)| Error::OAuth(format!("XOAUTH2 rejected: {:?}", e)))?;

    debug!("IMAP session established for {}", self.account_id);
    Ok(session)
  }

  async fn connect_with_retry(&self) -> Result<Session> {
    let mut delay = Duration::from_secs(1);
    let mut last = None;

    for attempt in 1..=MAX_CONNECT_RETRIES {
      match self.connect().await {
        Ok(session) => return Ok(session),
        Err(e) if e.requires_reauth() => return Err(e),
        Err(e) => {
          warn!(
            "IMAP connect attempt {}/{} failed for {}: {}",
            attempt, MAX_CONNECT_RETRIES, self.account_id, e
          );
          last = Some(e);
          if attempt < MAX_CONNECT_RETRIES {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(30));
          }
        }
      }
    }
    Err(last.unwrap_or_else(|| Error::Imap("connect failed".into())))
  }

  async fn select_session(&self, session: &mut Session, folder: &str) -> Result<FolderInfo> {
    let mailbox = session
      .select(folder)
      .await
      .map_err(|e| Error::Imap(format!("select {}: {:?}", folder, e)))?;
    Ok(FolderInfo {
      name: folder.to_string(),
      uid_validity: mailbox.uid_validity.unwrap_or(0),
      exists: mailbox.exists,
    })
  }

  fn parse_message(&self, folder: &str, uid_validity: u32, fetch: &async_imap::types::Fetch) -> Result<Option<MailItem>> {
    let Some(uid) = fetch.uid else { return Ok(None) };
    let Some(body) = fetch.body() else { return Ok(None) };

    let parsed = mail_parser::MessageParser::default().parse(body).ok_or_else(|| Error::Poison {
      id: format!("{}/{}/{}", self.account_id, folder, uid),
      reason: "unparseable RFC 5322 payload".into(),
    })?;

    let message_id = parsed
      .message_id()
      .map(|s| format!("<{}>", s.trim_matches(['<', '>'])))
      .unwrap_or_else(|| format!("<{}.{}@imap.invalid>", uid_validity, uid));

    let from = parsed
      .from()
      .and_then(|addrs| addrs.first())
      .map(|addr| Address {
        name: addr.name().map(|s| s.to_string()),
        email: addr.address().map(|s| s.to_string()).unwrap_or_default(),
      })
      .unwrap_or_else(|| Address::new("unknown@invalid"));

    let collect = |addrs: Option<&mail_parser::Address<'_>>| -> Vec<Address> {
      addrs
        .map(|list| {
          list
            .iter()
            .map(|a| Address {
              name: a.name().map(|s| s.to_string()),
              email: a.address().map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect()
        })
        .unwrap_or_default()
    };

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let date = parsed
      .date()
      .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
      .unwrap_or_else(Utc::now);

    let body_plain = parsed.body_text(0).map(|s| s.to_string()).unwrap_or_default();
    let body_html = parsed.body_html(0).map(|s| s.to_string());
    let snippet: String = body_plain.chars().take(200).collect();

    let attachments: Vec<Attachment> = parsed
      .attachments()
      .map(|part| {
        let mut attachment = Attachment::new(
          uuid::Uuid::new_v4().to_string(),
          part.attachment_name().unwrap_or("attachment"),
          part
            .content_type()
            .map(|ct| {
              format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or("octet-stream"))
            })
            .unwrap_or_else(|| "application/octet-stream".to_string()),
          part.len() as u64,
        );
        attachment.content_id = part.content_id().map(|s| s.to_string());
        attachment
      })
      .collect();

    let flags: Vec<String> = fetch.flags().map(flag_name).collect();

    // TODO: surface X-GM-MSGID / X-GM-THRID once async-imap exposes
    // FETCH extension items; until then the UID stands in for both.
    let provider_message_id = uid as u64;
    let thread_id = uid as u64;

    let in_reply_to = parsed.in_reply_to().as_text().map(|s| s.to_string());
    let references: Vec<String> = parsed
      .references()
      .as_text_list()
      .map(|list| list.into_iter().map(|s| s.to_string()).collect())
      .unwrap_or_default();

    Ok(Some(MailItem {
      id: MailItem::stable_id(&self.account_id, &message_id),
      account_id: self.account_id.clone(),
      account_alias: None,
      message_id,
      provider_message_id,
      thread_id,
      uid,
      uid_validity,
      in_reply_to,
      references,
      folder: folder.to_string(),
      labels: vec![],
      flags,
      from,
      to: collect(parsed.to()),
      cc: collect(parsed.cc()),
      bcc: vec![],
      subject,
      date,
      body_plain,
      body_html,
      snippet,
      attachments,
      embedding: None,
      needs_embedding: true,
      synced_at: Utc::now(),
      raw_size: body.len() as u64,
    }))
  }
}

fn flag_name(flag: Flag<'_>) -> String {
  match flag {
    Flag::Seen => "\\Seen".to_string(),
    Flag::Answered => "\\Answered".to_string(),
    Flag::Flagged => "\\Flagged".to_string(),
    Flag::Deleted => "\\Deleted".to_string(),
    Flag::Draft => "\\Draft".to_string(),
    Flag::Recent => "\\Recent".to_string(),
    Flag::MayCreate => "\\*".to_string(),
    Flag::Custom(name) => name.to_string(),
  }
}

fn uid_set(uids: &[u32]) -> String {
  uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl MailAdapter for GmailImap {
  async fn verify(&self) -> Result<()> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect().await?;
    session.logout().await.ok();
    Ok(())
  }

  async fn list_folders(&self) -> Result<Vec<String>> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;

    let names: Vec<_> = session
      .list(Some(""), Some("*"))
      .await
      .map_err(|e| Error::Imap(format!("list: {:?}", e)))?
      .collect()
      .await;

    let mut folders = Vec::new();
    for name in names {
      match name {
        Ok(name) => folders.push(name.name().to_string()),
        Err(e) => warn!("list entry error: {:?}", e),
      }
    }
    session.logout().await.ok();
    Ok(folders)
  }

  async fn select(&self, folder: &str) -> Result<FolderInfo> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    let info = self.select_session(&mut session, folder).await?;
    session.logout().await.ok();
    Ok(info)
  }

  async fn search_since(&self, folder: &str, since: DateTime<Utc>, before: Option<DateTime<Utc>>) -> Result<Vec<u32>> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    // A two-day buffer on BEFORE catches messages straddling timezone
    // boundaries; IMAP SEARCH is date-granular.
    let query = match before {
      Some(before) => format!(
        "SINCE {} BEFORE {}",
        since.format("%d-%b-%Y"),
        (before + chrono::Duration::days(2)).format("%d-%b-%Y")
      ),
      None => format!("SINCE {}", since.format("%d-%b-%Y")),
    };

    self.limiter.acquire_for(&self.account_id).await?;
    let uids = session
      .uid_search(&query)
      .await
      .map_err(|e| Error::Imap(format!("search: {:?}", e)))?;
    session.logout().await.ok();

    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn search_unread_or_flagged(&self, folder: &str) -> Result<Vec<u32>> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let unseen = session
      .uid_search("UNSEEN")
      .await
      .map_err(|e| Error::Imap(format!("search unseen: {:?}", e)))?;

    self.limiter.acquire_for(&self.account_id).await?;
    let flagged = session
      .uid_search("FLAGGED")
      .await
      .map_err(|e| Error::Imap(format!("search flagged: {:?}", e)))?;
    session.logout().await.ok();

    let mut uids: Vec<u32> = unseen.union(&flagged).copied().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn search_after(&self, folder: &str, after_uid: u32) -> Result<Vec<u32>> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let query = format!("UID {}:*", after_uid.saturating_add(1));
    let uids = session
      .uid_search(&query)
      .await
      .map_err(|e| Error::Imap(format!("search after: {:?}", e)))?;
    session.logout().await.ok();

    // "N:*" always matches the highest UID, even below the watermark.
    let mut uids: Vec<u32> = uids.into_iter().filter(|&u| u > after_uid).collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
  }

  async fn fetch_envelopes(&self, folder: &str, uids: &[u32]) -> Result<Vec<EnvelopeSummary>> {
    if uids.is_empty() {
      return Ok(vec![]);
    }
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let fetches: Vec<_> = session
      .uid_fetch(uid_set(uids), "(UID RFC822.SIZE FLAGS)")
      .await
      .map_err(|e| Error::Imap(format!("envelope fetch: {:?}", e)))?
      .collect()
      .await;
    session.logout().await.ok();

    let mut envelopes = Vec::new();
    for fetch in fetches {
      match fetch {
        Ok(fetch) => {
          if let Some(uid) = fetch.uid {
            envelopes.push(EnvelopeSummary {
              uid,
              size: fetch.size.unwrap_or(0) as u64,
              flags: fetch.flags().map(flag_name).collect(),
            });
          }
        }
        Err(e) => warn!("envelope stream error: {:?}", e),
      }
    }
    Ok(envelopes)
  }

  async fn fetch_bodies(&self, folder: &str, uids: &[u32]) -> Result<Vec<MailItem>> {
    if uids.is_empty() {
      return Ok(vec![]);
    }
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    let info = self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let fetches: Vec<_> = session
      .uid_fetch(uid_set(uids), "(UID FLAGS BODY.PEEK[] X-GM-MSGID X-GM-THRID X-GM-LABELS)")
      .await
      .map_err(|e| Error::Imap(format!("body fetch: {:?}", e)))?
      .collect()
      .await;
    session.logout().await.ok();

    let mut items = Vec::new();
    let mut parse_errors = 0;
    for fetch in fetches {
      match fetch {
        Ok(fetch) => match self.parse_message(folder, info.uid_validity, &fetch) {
          Ok(Some(item)) => items.push(item),
          Ok(None) => {}
          Err(e) => {
            parse_errors += 1;
            debug!("skipping malformed message: {}", e);
          }
        },
        Err(e) => {
          parse_errors += 1;
          debug!("fetch stream error: {:?}", e);
        }
      }
    }
    if parse_errors > 0 {
      warn!("{} messages in {}/{} failed to parse", parse_errors, self.account_id, folder);
    }

    items.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(items)
  }

  async fn idle(&self, folder: &str) -> Result<MailboxEvent> {
    // IDLE holds its own connection; it does not take the control
    // channel, otherwise it would starve fetches for half an hour.
    let mut session = self.connect().await?;
    self.select_session(&mut session, folder).await?;

    info!("IDLE open on {}/{}", self.account_id, folder);
    let mut handle = session.idle();
    handle.init().await.map_err(|e| Error::Imap(format!("idle init: {:?}", e)))?;

    let (wait, _stop) = handle.wait_with_timeout(IDLE_WINDOW);
    match wait.await {
      Ok(_) => Ok(MailboxEvent::Changed),
      Err(e) => {
        debug!("idle wait ended: {:?}", e);
        Ok(MailboxEvent::Timeout)
      }
    }
  }

  async fn store_flags(&self, folder: &str, uid: u32, add: &[String], remove: &[String]) -> Result<()> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    if !add.is_empty() {
      self.limiter.acquire_for(&self.account_id).await?;
      let command = format!("+FLAGS ({})", add.join(" "));
      let _: Vec<_> = session
        .uid_store(uid.to_string(), &command)
        .await
        .map_err(|e| Error::Imap(format!("store: {:?}", e)))?
        .collect()
        .await;
    }
    if !remove.is_empty() {
      self.limiter.acquire_for(&self.account_id).await?;
      let command = format!("-FLAGS ({})", remove.join(" "));
      let _: Vec<_> = session
        .uid_store(uid.to_string(), &command)
        .await
        .map_err(|e| Error::Imap(format!("store: {:?}", e)))?
        .collect()
        .await;
    }
    session.logout().await.ok();
    Ok(())
  }

  async fn copy_message(&self, folder: &str, uid: u32, destination: &str) -> Result<()> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    session
      .uid_copy(uid.to_string(), destination)
      .await
      .map_err(|e| Error::Imap(format!("copy: {:?}", e)))?;
    session.logout().await.ok();
    Ok(())
  }

  async fn delete_message(&self, folder: &str, uid: u32) -> Result<()> {
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let _: Vec<_> = session
      .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
      .await
      .map_err(|e| Error::Imap(format!("store deleted: {:?}", e)))?
      .collect()
      .await;

    self.limiter.acquire_for(&self.account_id).await?;
    let _: Vec<_> = session
      .expunge()
      .await
      .map_err(|e| Error::Imap(format!("expunge: {:?}", e)))?
      .collect()
      .await;
    session.logout().await.ok();
    Ok(())
  }

  async fn fetch_attachment(&self, folder: &str, uid: u32, filename: &str) -> Result<(Vec<u8>, String)> {
    let _large = self.limiter.large_body().acquire_owned().await.ok();
    let _permit = self.limiter.control_channel(&self.account_id).acquire_owned().await.ok();
    let mut session = self.connect_with_retry().await?;
    self.select_session(&mut session, folder).await?;

    self.limiter.acquire_for(&self.account_id).await?;
    let fetches: Vec<_> = session
      .uid_fetch(uid.to_string(), "BODY.PEEK[]")
      .await
      .map_err(|e| Error::Imap(format!("attachment fetch: {:?}", e)))?
      .collect()
      .await;
    session.logout().await.ok();

    let fetch = fetches
      .into_iter()
      .next()
      .ok_or_else(|| Error::MailNotFound(format!("uid {} in {}", uid, folder)))?
      .map_err(|e| Error::Imap(format!("attachment fetch: {:?}", e)))?;
    let body = fetch
      .body()
      .ok_or_else(|| Error::Imap("no body in attachment fetch".into()))?;

    let parsed = mail_parser::MessageParser::default()
      .parse(body)
      .ok_or_else(|| Error::Imap("unparseable message".into()))?;

    for part in parsed.attachments() {
      if part.attachment_name().unwrap_or("attachment") == filename {
        let mime = part
          .content_type()
          .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or("octet-stream")))
          .unwrap_or_else(|| "application/octet-stream".to_string());
        return Ok((part.contents().to_vec(), mime));
      }
    }

    Err(Error::MailNotFound(format!("attachment '{}' in uid {}", filename, uid)))
  }
}

/// Replace characters the filesystem will not take.
pub fn sanitize_filename(name: &str) -> String {
  name
    .chars()
    .map(|c| match c {
      '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
      c if c.is_control() => '_',
      c => c,
    })
    .collect::<String>()
    .trim()
    .to_string()
}
