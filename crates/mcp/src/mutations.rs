//! Mutation router.
//!
//! Mutations never write to the store; they call the provider and nudge
//! the daemon so sync observes the result. Without an asserted confirm
//! flag the router returns a structured preview and touches nothing.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use daemon::ControlClient;
use groundeffect_core::{CalendarItem, Config, Error, Result, SendMailRequest, TokenManager};
use store::Store;
use sync::{AdapterRegistry, MailAdapter};

const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// Outbound mail capability; tests substitute a recording fake.
#[async_trait]
pub trait MailSubmitter: Send + Sync {
  /// Upload a raw RFC-5322 message; returns the provider message id.
  async fn submit(&self, account_id: &str, raw: &[u8]) -> Result<String>;
}

/// Gmail raw-message submit endpoint.
pub struct GmailSubmitter {
  tokens: Arc<TokenManager>,
  client: reqwest::Client,
}

impl GmailSubmitter {
  pub fn new(tokens: Arc<TokenManager>) -> Self {
    Self {
      tokens,
      client: reqwest::Client::new(),
    }
  }
}

#[async_trait]
impl MailSubmitter for GmailSubmitter {
  async fn submit(&self, account_id: &str, raw: &[u8]) -> Result<String> {
    let access_token = self.tokens.get_valid_token(account_id).await?;
    let encoded = URL_SAFE_NO_PAD.encode(raw);

    let response = self
      .client
      .post(GMAIL_SEND_URL)
      .bearer_auth(&access_token)
      .json(&json!({ "raw": encoded }))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::OAuth(format!("submit rejected: {} {}", status, body)));
      }
      return Err(Error::Other(format!("submit failed: {} {}", status, body)));
    }

    let result: Value = response.json().await?;
    Ok(result["id"].as_str().unwrap_or_default().to_string())
  }
}

pub struct MutationRouter {
  store: Arc<Store>,
  config: Arc<Config>,
  submitter: Arc<dyn MailSubmitter>,
  adapters: Arc<AdapterRegistry>,
  control: ControlClient,
}

impl MutationRouter {
  pub fn new(
    store: Arc<Store>,
    config: Arc<Config>,
    submitter: Arc<dyn MailSubmitter>,
    adapters: Arc<AdapterRegistry>,
    control: ControlClient,
  ) -> Self {
    Self {
      store,
      config,
      submitter,
      adapters,
      control,
    }
  }

  fn resolve(&self, identifier: &str) -> Result<String> {
    self
      .config
      .resolve_account(identifier)
      .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", identifier)))
  }

  /// Best-effort nudge to the daemon; a missing daemon is reported via
  /// a note, never as a failure of the mutation itself.
  async fn hint(&self, account_id: &str, kind: &str, event_id: Option<&str>) -> Option<String> {
    let mut params = json!({ "account": account_id, "kind": kind });
    if let Some(event_id) = event_id {
      params["event_id"] = json!(event_id);
    }
    match self.control.call("mutation_hint", params).await {
      Ok(_) => None,
      Err(e) => {
        warn!("mutation hint not delivered: {}", e);
        Some("daemon not reachable; the change will appear on the next scheduled sync".to_string())
      }
    }
  }

  /// Send mail, or preview it when confirm is not asserted.
  pub async fn send_mail(&self, request: &SendMailRequest) -> Result<Value> {
    let from_email = self.resolve(&request.from_account)?;
    let account = self
      .store
      .get_account(&from_email)
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::AccountNotFound(from_email.clone()))?;

    if request.to.is_empty() {
      return Err(Error::BadRequest("at least one recipient required".into()));
    }

    // Threading headers from the replied-to message.
    let mut subject = request.subject.clone();
    let mut in_reply_to = None;
    let mut references: Vec<String> = vec![];
    if let Some(reply_to_id) = &request.reply_to_id {
      if let Some(parent) = self
        .store
        .get_mail(reply_to_id)
        .await
        .map_err(|e| Error::Store(e.to_string()))?
      {
        in_reply_to = Some(parent.message_id.clone());
        references = parent.references.clone();
        references.push(parent.message_id.clone());
        if !subject.to_lowercase().starts_with("re:") {
          subject = format!("Re: {}", parent.subject);
        }
      }
    }

    if !request.confirm {
      return Ok(json!({
        "status": "preview",
        "message": "call send_mail again with confirm=true to send",
        "mail": {
          "from": format!("{} <{}>", account.display_name, from_email),
          "to": request.to,
          "cc": request.cc,
          "bcc": request.bcc,
          "subject": subject,
          "body": request.body,
          "in_reply_to": in_reply_to,
          "references": references,
        }
      }));
    }

    let raw = build_message(
      &account.display_name,
      &from_email,
      &request.to,
      &request.cc,
      &request.bcc,
      &subject,
      &request.body,
      in_reply_to.as_deref(),
      &references,
    );

    let message_id = self.submitter.submit(&from_email, raw.as_bytes()).await?;
    info!("sent mail {} from {}", message_id, from_email);

    let note = self.hint(&from_email, "mail_sent", None).await;
    let mut result = json!({
      "status": "sent",
      "message_id": message_id,
      "from": from_email,
      "to": request.to,
      "subject": subject,
    });
    if let Some(note) = note {
      result["note"] = json!(note);
    }
    Ok(result)
  }

  pub async fn create_event(&self, account: &str, item: &CalendarItem) -> Result<Value> {
    let account_id = self.resolve(account)?;
    let adapter = self.adapters.calendar(&account_id)?;

    let (provider_event_id, etag) = adapter.create_event(item).await?;
    let note = self.hint(&account_id, "calendar_changed", Some(&provider_event_id)).await;

    let mut result = json!({
      "status": "created",
      "event_id": provider_event_id,
      "etag": etag,
    });
    if let Some(note) = note {
      result["note"] = json!(note);
    }
    Ok(result)
  }

  pub async fn update_event(&self, account: &str, item: &CalendarItem) -> Result<Value> {
    let account_id = self.resolve(account)?;
    let adapter = self.adapters.calendar(&account_id)?;

    let etag = adapter.update_event(item).await?;
    let note = self.hint(&account_id, "calendar_changed", Some(&item.provider_event_id)).await;

    let mut result = json!({
      "status": "updated",
      "event_id": item.provider_event_id,
      "etag": etag,
    });
    if let Some(note) = note {
      result["note"] = json!(note);
    }
    Ok(result)
  }

  pub async fn delete_event(&self, account: &str, calendar_id: &str, provider_event_id: &str) -> Result<Value> {
    let account_id = self.resolve(account)?;
    let adapter = self.adapters.calendar(&account_id)?;

    adapter.delete_event(calendar_id, provider_event_id).await?;
    let note = self.hint(&account_id, "calendar_changed", Some(provider_event_id)).await;

    let mut result = json!({ "status": "deleted", "event_id": provider_event_id });
    if let Some(note) = note {
      result["note"] = json!(note);
    }
    Ok(result)
  }

  async fn mail_location(&self, mail_id: &str) -> Result<(Arc<dyn MailAdapter>, String, String, u32)> {
    let item = self
      .store
      .get_mail(mail_id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::MailNotFound(mail_id.to_string()))?;
    let adapter = self.adapters.mail(&item.account_id)?;
    Ok((adapter, item.account_id, item.folder, item.uid))
  }

  pub async fn mark_read(&self, mail_id: &str) -> Result<Value> {
    let (adapter, account_id, folder, uid) = self.mail_location(mail_id).await?;
    adapter.store_flags(&folder, uid, &["\\Seen".to_string()], &[]).await?;
    let note = self.hint(&account_id, "mail_sent", None).await;
    Ok(flag_result("marked_read", mail_id, note))
  }

  pub async fn mark_unread(&self, mail_id: &str) -> Result<Value> {
    let (adapter, account_id, folder, uid) = self.mail_location(mail_id).await?;
    adapter.store_flags(&folder, uid, &[], &["\\Seen".to_string()]).await?;
    let note = self.hint(&account_id, "mail_sent", None).await;
    Ok(flag_result("marked_unread", mail_id, note))
  }

  /// Gmail archive: copy into All Mail, expunge from the source folder.
  pub async fn archive(&self, mail_id: &str) -> Result<Value> {
    let (adapter, account_id, folder, uid) = self.mail_location(mail_id).await?;
    adapter.copy_message(&folder, uid, "[Gmail]/All Mail").await?;
    adapter.delete_message(&folder, uid).await?;
    let note = self.hint(&account_id, "mail_sent", None).await;
    Ok(flag_result("archived", mail_id, note))
  }

  pub async fn move_mail(&self, mail_id: &str, destination: &str) -> Result<Value> {
    if destination.trim().is_empty() {
      return Err(Error::BadRequest("destination folder required".into()));
    }
    let (adapter, account_id, folder, uid) = self.mail_location(mail_id).await?;
    adapter.copy_message(&folder, uid, destination).await?;
    adapter.delete_message(&folder, uid).await?;
    let note = self.hint(&account_id, "mail_sent", None).await;
    Ok(flag_result("moved", mail_id, note))
  }

  pub async fn delete_mail(&self, mail_id: &str) -> Result<Value> {
    let (adapter, account_id, folder, uid) = self.mail_location(mail_id).await?;
    adapter.copy_message(&folder, uid, "[Gmail]/Trash").await?;
    adapter.delete_message(&folder, uid).await?;
    let note = self.hint(&account_id, "mail_sent", None).await;
    Ok(flag_result("deleted", mail_id, note))
  }

  pub async fn trigger_sync(&self, accounts: &[String]) -> Result<Value> {
    let mut resolved = Vec::with_capacity(accounts.len());
    for account in accounts {
      resolved.push(self.resolve(account)?);
    }
    let response = self.control.call("trigger_sync", json!({ "accounts": resolved })).await?;
    Ok(response.result.unwrap_or_else(|| json!({ "triggered": 0 })))
  }
}

fn flag_result(status: &str, mail_id: &str, note: Option<String>) -> Value {
  let mut result = json!({ "status": status, "id": mail_id });
  if let Some(note) = note {
    result["note"] = json!(note);
  }
  result
}

/// Assemble the outbound RFC-5322 message.
#[allow(clippy::too_many_arguments)]
pub fn build_message(
  display_name: &str,
  from_email: &str,
  to: &[String],
  cc: &[String],
  bcc: &[String],
  subject: &str,
  body: &str,
  in_reply_to: Option<&str>,
  references: &[String],
) -> String {
  let mut message = format!("From: {} <{}>\r\nTo: {}\r\n", display_name, from_email, to.join(", "));

  if !cc.is_empty() {
    message.push_str(&format!("Cc: {}\r\n", cc.join(", ")));
  }
  if !bcc.is_empty() {
    message.push_str(&format!("Bcc: {}\r\n", bcc.join(", ")));
  }
  if let Some(in_reply_to) = in_reply_to {
    message.push_str(&format!("In-Reply-To: {}\r\n", in_reply_to));
  }
  if !references.is_empty() {
    message.push_str(&format!("References: {}\r\n", references.join(" ")));
  }

  message.push_str(&format!("Subject: {}\r\n", subject));
  message.push_str("MIME-Version: 1.0\r\n");
  message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
  message.push_str(body);
  message
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_message_headers() {
    let raw = build_message(
      "Test Account",
      "a@x.test",
      &["c@z.test".to_string()],
      &[],
      &[],
      "Re: Hi",
      "body text",
      Some("<parent@x>"),
      &["<root@x>".to_string(), "<parent@x>".to_string()],
    );

    assert!(raw.starts_with("From: Test Account <a@x.test>\r\n"));
    assert!(raw.contains("To: c@z.test\r\n"));
    assert!(raw.contains("In-Reply-To: <parent@x>\r\n"));
    assert!(raw.contains("References: <root@x> <parent@x>\r\n"));
    assert!(raw.contains("Subject: Re: Hi\r\n"));
    assert!(raw.ends_with("\r\n\r\nbody text"));
    assert!(!raw.contains("Cc:"));
  }

  #[test]
  fn test_build_message_cc_bcc() {
    let raw = build_message(
      "A",
      "a@x.test",
      &["b@y.test".to_string()],
      &["c@z.test".to_string()],
      &["d@w.test".to_string()],
      "s",
      "b",
      None,
      &[],
    );
    assert!(raw.contains("Cc: c@z.test\r\n"));
    assert!(raw.contains("Bcc: d@w.test\r\n"));
    assert!(!raw.contains("In-Reply-To"));
  }
}
