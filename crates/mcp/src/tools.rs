//! Tool dispatch for the query server.
//!
//! Every tool returns either a result or a structured
//! `{error: {code, message, action?}}`, never both. Validation failures
//! never touch the store or the provider.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use daemon::build_sync_status;
use groundeffect_core::{CalendarItem, Config, Error, EventStatus, EventTime, MailSummary, Result, SendMailRequest, Transparency};
use store::Store;
use sync::AdapterRegistry;

use crate::mutations::MutationRouter;
use crate::search::{CalendarSearchOptions, MailSearchOptions, SearchEngine};

/// The Gmail folder surface exposed to list_folders.
const GMAIL_FOLDERS: &[&str] = &[
  "INBOX",
  "[Gmail]/Sent Mail",
  "[Gmail]/Drafts",
  "[Gmail]/All Mail",
  "[Gmail]/Spam",
  "[Gmail]/Trash",
];

pub struct ToolHandler {
  store: Arc<Store>,
  engine: SearchEngine,
  router: MutationRouter,
  adapters: Arc<AdapterRegistry>,
  config: Arc<Config>,
}

impl ToolHandler {
  pub fn new(
    store: Arc<Store>,
    engine: SearchEngine,
    router: MutationRouter,
    adapters: Arc<AdapterRegistry>,
    config: Arc<Config>,
  ) -> Self {
    Self {
      store,
      engine,
      router,
      adapters,
      config,
    }
  }

  /// Dispatch one tool invocation into the error envelope contract.
  pub async fn dispatch(&self, name: &str, arguments: &Value) -> Value {
    debug!("tool {}", name);
    match self.execute(name, arguments).await {
      Ok(result) => json!({ "result": result }),
      Err(e) => {
        let mut error = json!({ "code": e.code(), "message": e.to_string() });
        if let Some(action) = e.action_hint() {
          error["action"] = json!(action);
        }
        json!({ "error": error })
      }
    }
  }

  pub async fn execute(&self, name: &str, args: &Value) -> Result<Value> {
    match name {
      "search_mail" => self.search_mail(args).await,
      "search_calendar" => self.search_calendar(args).await,
      "get_mail" => self.get_mail(args).await,
      "get_thread" => self.get_thread(args).await,
      "get_event" => self.get_event(args).await,
      "list_folders" => self.list_folders(args).await,
      "list_calendars" => self.list_calendars(args).await,
      "list_accounts" => self.list_accounts().await,
      "get_sync_status" => self.get_sync_status().await,
      "send_mail" => self.send_mail(args).await,
      "create_event" => self.create_event(args).await,
      "update_event" => self.update_event(args).await,
      "delete_event" => self.delete_event(args).await,
      "mark_read" => self.router.mark_read(required_str(args, "id")?).await,
      "mark_unread" => self.router.mark_unread(required_str(args, "id")?).await,
      "archive" => self.router.archive(required_str(args, "id")?).await,
      "move_mail" => {
        self
          .router
          .move_mail(required_str(args, "id")?, required_str(args, "folder")?)
          .await
      }
      "delete_mail" => self.router.delete_mail(required_str(args, "id")?).await,
      "trigger_sync" => self.trigger_sync(args).await,
      "get_attachment" => self.get_attachment(args).await,
      other => Err(Error::BadRequest(format!("unknown tool: {}", other))),
    }
  }

  async fn search_mail(&self, args: &Value) -> Result<Value> {
    let query = args["query"].as_str().unwrap_or_default();
    let options = MailSearchOptions {
      accounts: str_list(args, "accounts"),
      limit: args["limit"].as_u64().unwrap_or(0) as usize,
      folder: args["folder"].as_str().map(String::from),
      from: args["from"].as_str().map(String::from),
      to: args["to"].as_str().map(String::from),
      date_from: parse_date(args, "date_from")?,
      date_to: parse_date(args, "date_to")?,
      has_attachment: args["has_attachment"].as_bool(),
    };

    let response = self.engine.search_mail(query, &options).await?;
    Ok(serde_json::to_value(response)?)
  }

  async fn search_calendar(&self, args: &Value) -> Result<Value> {
    let query = args["query"].as_str().unwrap_or_default();
    let options = CalendarSearchOptions {
      accounts: str_list(args, "accounts"),
      limit: args["limit"].as_u64().unwrap_or(0) as usize,
      calendar_id: args["calendar_id"].as_str().map(String::from),
      date_from: parse_date(args, "date_from")?,
      date_to: parse_date(args, "date_to")?,
    };

    let response = self.engine.search_calendar(query, &options).await?;
    Ok(serde_json::to_value(response)?)
  }

  async fn get_mail(&self, args: &Value) -> Result<Value> {
    let id = required_str(args, "id")?;
    let item = self
      .store
      .get_mail(id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::MailNotFound(id.to_string()))?;

    let total_body_chars = item.body_plain.chars().count();
    let cap = self.config.search.body_max_chars;
    let truncated = total_body_chars > cap;
    let body: String = if truncated {
      item.body_plain.chars().take(cap).collect()
    } else {
      item.body_plain.clone()
    };

    let mut summary = MailSummary::from(&item);
    summary.truncated = Some(truncated);
    summary.total_body_chars = Some(total_body_chars);

    let mut result = serde_json::to_value(&summary)?;
    result["body"] = json!(body);
    Ok(result)
  }

  async fn get_thread(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let account_id = self
      .config
      .resolve_account(account)
      .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", account)))?;
    let thread_id: u64 = required_str(args, "thread_id")?
      .parse()
      .map_err(|_| Error::BadRequest("thread_id must be numeric".into()))?;

    let items = self
      .store
      .get_thread(&account_id, thread_id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    if items.is_empty() {
      return Err(Error::MailNotFound(format!("thread {}", thread_id)));
    }

    let messages: Vec<Value> = items
      .iter()
      .map(|item| {
        let mut value = serde_json::to_value(MailSummary::from(item)).unwrap_or_default();
        value["body"] = json!(item.body_plain);
        value
      })
      .collect();

    Ok(json!({
      "thread_id": thread_id.to_string(),
      "account_id": account_id,
      "message_count": messages.len(),
      "messages": messages,
    }))
  }

  async fn get_event(&self, args: &Value) -> Result<Value> {
    let id = required_str(args, "id")?;
    let event = self
      .store
      .get_event(id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::EventNotFound(id.to_string()))?;
    Ok(serde_json::to_value(&event)?)
  }

  async fn list_folders(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let account_id = self
      .config
      .resolve_account(account)
      .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", account)))?;
    Ok(json!({ "account_id": account_id, "folders": GMAIL_FOLDERS }))
  }

  async fn list_calendars(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let account_id = self
      .config
      .resolve_account(account)
      .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", account)))?;

    let mut calendars = self
      .store
      .list_calendars(&account_id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    if calendars.is_empty() {
      calendars.push("primary".to_string());
    }
    Ok(json!({ "account_id": account_id, "calendars": calendars }))
  }

  async fn list_accounts(&self) -> Result<Value> {
    let accounts = self
      .store
      .list_accounts()
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    let listed: Vec<Value> = accounts
      .iter()
      .map(|account| {
        json!({
          "id": account.id,
          "alias": account.alias,
          "display_name": account.display_name,
          "status": account.status,
          "last_email_sync": account.last_email_sync,
          "last_calendar_sync": account.last_calendar_sync,
        })
      })
      .collect();
    Ok(json!({ "accounts": listed }))
  }

  async fn get_sync_status(&self) -> Result<Value> {
    // Pick up the writer's latest manifest before counting.
    self.store.refresh().await.map_err(|e| Error::Store(e.to_string()))?;
    let status = build_sync_status(&self.store).await?;
    Ok(serde_json::to_value(&status)?)
  }

  async fn send_mail(&self, args: &Value) -> Result<Value> {
    let request: SendMailRequest = serde_json::from_value(args.clone())
      .map_err(|e| Error::BadRequest(format!("invalid send_mail arguments: {}", e)))?;
    self.router.send_mail(&request).await
  }

  async fn create_event(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let item = event_from_args(account, args, None)?;
    self.router.create_event(account, &item).await
  }

  async fn update_event(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let account_id = self
      .config
      .resolve_account(account)
      .ok_or_else(|| Error::BadRequest(format!("unknown account or alias: {}", account)))?;
    let event_id = required_str(args, "event_id")?;

    let existing = self
      .store
      .get_event(&CalendarItem::stable_id(&account_id, event_id))
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;

    let item = event_from_args(account, args, Some(existing))?;
    self.router.update_event(account, &item).await
  }

  async fn delete_event(&self, args: &Value) -> Result<Value> {
    let account = required_str(args, "account")?;
    let calendar_id = args["calendar_id"].as_str().unwrap_or("primary");
    let event_id = required_str(args, "event_id")?;
    self.router.delete_event(account, calendar_id, event_id).await
  }

  async fn trigger_sync(&self, args: &Value) -> Result<Value> {
    let accounts = str_list(args, "accounts").unwrap_or_default();
    self.router.trigger_sync(&accounts).await
  }

  /// Download an attachment on demand. The bytes land under the
  /// attachments directory; the store row catches up on the next sync.
  async fn get_attachment(&self, args: &Value) -> Result<Value> {
    let mail_id = required_str(args, "id")?;
    let filename = required_str(args, "filename")?;

    let item = self
      .store
      .get_mail(mail_id)
      .await
      .map_err(|e| Error::Store(e.to_string()))?
      .ok_or_else(|| Error::MailNotFound(mail_id.to_string()))?;

    let attachment = item
      .attachments
      .iter()
      .find(|a| a.filename == filename)
      .ok_or_else(|| Error::MailNotFound(format!("attachment '{}' on {}", filename, mail_id)))?;

    if let Some(path) = &attachment.local_path {
      if path.exists() {
        return Ok(json!({
          "path": path,
          "mime_type": attachment.mime_type,
          "size": attachment.size,
          "downloaded": true,
        }));
      }
    }

    let cap = self.config.sync.attachment_max_size_mb * 1024 * 1024;
    if attachment.size > cap {
      return Err(Error::BadRequest(format!(
        "attachment is {} which exceeds the {} MB limit",
        attachment.size_human(),
        self.config.sync.attachment_max_size_mb
      )));
    }

    let adapter = self.adapters.mail(&item.account_id)?;
    let (bytes, mime) = adapter.fetch_attachment(&item.folder, item.uid, filename).await?;

    let dir = self
      .config
      .attachments_dir()
      .join(&item.account_id)
      .join(sync::sanitize_filename(&item.message_id));
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(sync::sanitize_filename(filename));
    tokio::fs::write(&path, &bytes).await?;

    Ok(json!({
      "path": path,
      "mime_type": mime,
      "size": bytes.len(),
      "downloaded": true,
    }))
  }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
  args[key]
    .as_str()
    .filter(|s| !s.is_empty())
    .ok_or_else(|| Error::BadRequest(format!("missing required field: {}", key)))
}

fn str_list(args: &Value, key: &str) -> Option<Vec<String>> {
  args[key]
    .as_array()
    .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
}

fn parse_date(args: &Value, key: &str) -> Result<Option<DateTime<Utc>>> {
  let Some(raw) = args[key].as_str() else { return Ok(None) };
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Ok(Some(dt.with_timezone(&Utc)));
  }
  if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
    let dt = date
      .and_hms_opt(0, 0, 0)
      .map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc));
    return Ok(dt);
  }
  Err(Error::BadRequest(format!(
    "{} must be RFC 3339 or YYYY-MM-DD, got '{}'",
    key, raw
  )))
}

fn event_from_args(account: &str, args: &Value, existing: Option<CalendarItem>) -> Result<CalendarItem> {
  let parse_time = |value: &Value| -> Result<Option<EventTime>> {
    match value.as_str() {
      Some(raw) => EventTime::parse_wire(raw)
        .map(Some)
        .ok_or_else(|| Error::BadRequest(format!("invalid event time '{}'", raw))),
      None => Ok(None),
    }
  };

  let mut item = existing.unwrap_or_else(|| CalendarItem {
    id: String::new(),
    account_id: account.to_string(),
    account_alias: None,
    provider_event_id: String::new(),
    ical_uid: String::new(),
    etag: String::new(),
    summary: String::new(),
    description: None,
    location: None,
    start: EventTime::DateTime(Utc::now()),
    end: EventTime::DateTime(Utc::now()),
    timezone: "UTC".to_string(),
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
    calendar_id: "primary".to_string(),
    synced_at: Utc::now(),
  });

  if let Some(summary) = args["summary"].as_str() {
    item.summary = summary.to_string();
  }
  if item.summary.is_empty() {
    return Err(Error::BadRequest("missing required field: summary".into()));
  }
  if let Some(start) = parse_time(&args["start"])? {
    item.all_day = matches!(start, EventTime::Date(_));
    item.start = start;
  }
  if let Some(end) = parse_time(&args["end"])? {
    item.end = end;
  }
  if let Some(description) = args["description"].as_str() {
    item.description = Some(description.to_string());
  }
  if let Some(location) = args["location"].as_str() {
    item.location = Some(location.to_string());
  }
  if let Some(timezone) = args["timezone"].as_str() {
    item.timezone = timezone.to_string();
  }
  if let Some(calendar_id) = args["calendar_id"].as_str() {
    item.calendar_id = calendar_id.to_string();
  }
  if let Some(attendees) = args["attendees"].as_array() {
    item.attendees = attendees
      .iter()
      .filter_map(|v| v.as_str())
      .map(|email| groundeffect_core::Attendee {
        email: email.to_string(),
        name: None,
        response_status: None,
        optional: false,
      })
      .collect();
  }

  Ok(item)
}
