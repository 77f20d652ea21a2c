//! Arrow schemas for the three tables and conversions between domain
//! structs and record batches. Nested collections (addresses, labels,
//! attendees) are stored as JSON strings; the vector column is a
//! schema-fixed FixedSizeList<Float32>[768].

use arrow_array::{
  Array, ArrayRef, BooleanArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, StringArray, UInt32Array,
  UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use groundeffect_core::{
  Account, AccountStatus, Address, Attachment, Attendee, CalendarItem, EMBEDDING_DIM, EventStatus, EventTime,
  MailItem, Reminder, Transparency,
};
use std::sync::Arc;

use crate::connection::{Result, StoreError};

fn vector_field() -> Field {
  Field::new(
    "embedding",
    DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), EMBEDDING_DIM as i32),
    true,
  )
}

/// Schema for the mail table
pub fn mail_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("account_id", DataType::Utf8, false),
    Field::new("account_alias", DataType::Utf8, true),
    Field::new("message_id", DataType::Utf8, false),
    Field::new("provider_message_id", DataType::UInt64, false),
    Field::new("thread_id", DataType::UInt64, false),
    Field::new("uid", DataType::UInt32, false),
    Field::new("uid_validity", DataType::UInt32, false),
    Field::new("in_reply_to", DataType::Utf8, true),
    Field::new("references", DataType::Utf8, true), // JSON array
    Field::new("folder", DataType::Utf8, false),
    Field::new("labels", DataType::Utf8, true), // JSON array
    Field::new("flags", DataType::Utf8, true),  // JSON array
    Field::new("from_email", DataType::Utf8, false),
    Field::new("from_name", DataType::Utf8, true),
    Field::new("to", DataType::Utf8, true),  // JSON array
    Field::new("cc", DataType::Utf8, true),  // JSON array
    Field::new("bcc", DataType::Utf8, true), // JSON array
    Field::new("subject", DataType::Utf8, false),
    Field::new("date", DataType::Int64, false), // Unix seconds
    Field::new("body_plain", DataType::Utf8, false),
    Field::new("body_html", DataType::Utf8, true),
    Field::new("snippet", DataType::Utf8, false),
    Field::new("has_attachments", DataType::Boolean, false),
    Field::new("attachments", DataType::Utf8, true), // JSON array
    vector_field(),
    Field::new("needs_embedding", DataType::Boolean, false),
    Field::new("synced_at", DataType::Int64, false),
    Field::new("raw_size", DataType::UInt64, false),
  ]))
}

/// Schema for the events table
pub fn event_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("account_id", DataType::Utf8, false),
    Field::new("account_alias", DataType::Utf8, true),
    Field::new("provider_event_id", DataType::Utf8, false),
    Field::new("ical_uid", DataType::Utf8, false),
    Field::new("etag", DataType::Utf8, false),
    Field::new("summary", DataType::Utf8, false),
    Field::new("description", DataType::Utf8, true),
    Field::new("location", DataType::Utf8, true),
    Field::new("start", DataType::Utf8, false), // RFC 3339 or YYYY-MM-DD
    Field::new("end", DataType::Utf8, false),
    Field::new("start_ts", DataType::Int64, false), // Unix seconds, for range filters
    Field::new("end_ts", DataType::Int64, false),
    Field::new("timezone", DataType::Utf8, false),
    Field::new("all_day", DataType::Boolean, false),
    Field::new("recurrence_rule", DataType::Utf8, true),
    Field::new("recurrence_id", DataType::Utf8, true),
    Field::new("organizer", DataType::Utf8, true), // JSON object
    Field::new("attendees", DataType::Utf8, true), // JSON array
    Field::new("status", DataType::Utf8, false),
    Field::new("transparency", DataType::Utf8, false),
    Field::new("reminders", DataType::Utf8, true), // JSON array
    vector_field(),
    Field::new("needs_embedding", DataType::Boolean, false),
    Field::new("calendar_id", DataType::Utf8, false),
    Field::new("synced_at", DataType::Int64, false),
  ]))
}

/// Schema for the accounts table
pub fn account_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("alias", DataType::Utf8, true),
    Field::new("display_name", DataType::Utf8, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("added_at", DataType::Int64, false),
    Field::new("last_email_sync", DataType::Int64, true),
    Field::new("last_calendar_sync", DataType::Int64, true),
    Field::new("sync_email", DataType::Boolean, false),
    Field::new("sync_calendar", DataType::Boolean, false),
    Field::new("folders", DataType::Utf8, true), // JSON array
    Field::new("sync_attachments", DataType::Boolean, false),
    Field::new("sync_email_since", DataType::Int64, true),
    Field::new("oldest_email_synced", DataType::Int64, true),
  ]))
}

fn json_or_null<T: serde::Serialize>(values: &[T]) -> Result<Option<String>> {
  if values.is_empty() {
    Ok(None)
  } else {
    Ok(Some(serde_json::to_string(values)?))
  }
}

fn embedding_array<'a, I>(vectors: I, count: usize) -> Result<FixedSizeListArray>
where
  I: Iterator<Item = Option<&'a Vec<f32>>>,
{
  let mut values = Vec::with_capacity(count * EMBEDDING_DIM);
  for vector in vectors {
    match vector {
      Some(v) if v.len() == EMBEDDING_DIM => values.extend_from_slice(v),
      Some(v) => {
        return Err(StoreError::VectorWidth {
          expected: EMBEDDING_DIM,
          got: v.len(),
        });
      }
      None => values.extend(std::iter::repeat(0.0f32).take(EMBEDDING_DIM)),
    }
  }
  let field = Arc::new(Field::new("item", DataType::Float32, true));
  FixedSizeListArray::try_new(field, EMBEDDING_DIM as i32, Arc::new(Float32Array::from(values)), None)
    .map_err(StoreError::from)
}

/// Convert mail items to a record batch
pub fn mail_to_batch(items: &[MailItem]) -> Result<RecordBatch> {
  let ids: Vec<&str> = items.iter().map(|m| m.id.as_str()).collect();
  let account_ids: Vec<&str> = items.iter().map(|m| m.account_id.as_str()).collect();
  let aliases: Vec<Option<&str>> = items.iter().map(|m| m.account_alias.as_deref()).collect();
  let message_ids: Vec<&str> = items.iter().map(|m| m.message_id.as_str()).collect();
  let provider_ids: Vec<u64> = items.iter().map(|m| m.provider_message_id).collect();
  let thread_ids: Vec<u64> = items.iter().map(|m| m.thread_id).collect();
  let uids: Vec<u32> = items.iter().map(|m| m.uid).collect();
  let uid_validities: Vec<u32> = items.iter().map(|m| m.uid_validity).collect();
  let in_reply_tos: Vec<Option<&str>> = items.iter().map(|m| m.in_reply_to.as_deref()).collect();
  let references = items.iter().map(|m| json_or_null(&m.references)).collect::<Result<Vec<_>>>()?;
  let folders: Vec<&str> = items.iter().map(|m| m.folder.as_str()).collect();
  let labels = items.iter().map(|m| json_or_null(&m.labels)).collect::<Result<Vec<_>>>()?;
  let flags = items.iter().map(|m| json_or_null(&m.flags)).collect::<Result<Vec<_>>>()?;
  let from_emails: Vec<&str> = items.iter().map(|m| m.from.email.as_str()).collect();
  let from_names: Vec<Option<&str>> = items.iter().map(|m| m.from.name.as_deref()).collect();
  let tos: Vec<Option<String>> = items
    .iter()
    .map(|m| serde_json::to_string(&m.to).map(Some))
    .collect::<std::result::Result<_, _>>()?;
  let ccs = items.iter().map(|m| json_or_null(&m.cc)).collect::<Result<Vec<_>>>()?;
  let bccs = items.iter().map(|m| json_or_null(&m.bcc)).collect::<Result<Vec<_>>>()?;
  let subjects: Vec<&str> = items.iter().map(|m| m.subject.as_str()).collect();
  let dates: Vec<i64> = items.iter().map(|m| m.date.timestamp()).collect();
  let bodies: Vec<&str> = items.iter().map(|m| m.body_plain.as_str()).collect();
  let htmls: Vec<Option<&str>> = items.iter().map(|m| m.body_html.as_deref()).collect();
  let snippets: Vec<&str> = items.iter().map(|m| m.snippet.as_str()).collect();
  let has_attachments: Vec<bool> = items.iter().map(|m| m.has_attachments()).collect();
  let attachments = items
    .iter()
    .map(|m| json_or_null(&m.attachments))
    .collect::<Result<Vec<_>>>()?;
  let embeddings = embedding_array(items.iter().map(|m| m.embedding.as_ref()), items.len())?;
  let needs_embedding: Vec<bool> = items.iter().map(|m| m.needs_embedding).collect();
  let synced_ats: Vec<i64> = items.iter().map(|m| m.synced_at.timestamp()).collect();
  let raw_sizes: Vec<u64> = items.iter().map(|m| m.raw_size).collect();

  let arrays: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(ids)),
    Arc::new(StringArray::from(account_ids)),
    Arc::new(StringArray::from(aliases)),
    Arc::new(StringArray::from(message_ids)),
    Arc::new(UInt64Array::from(provider_ids)),
    Arc::new(UInt64Array::from(thread_ids)),
    Arc::new(UInt32Array::from(uids)),
    Arc::new(UInt32Array::from(uid_validities)),
    Arc::new(StringArray::from(in_reply_tos)),
    Arc::new(StringArray::from(as_deref(&references))),
    Arc::new(StringArray::from(folders)),
    Arc::new(StringArray::from(as_deref(&labels))),
    Arc::new(StringArray::from(as_deref(&flags))),
    Arc::new(StringArray::from(from_emails)),
    Arc::new(StringArray::from(from_names)),
    Arc::new(StringArray::from(as_deref(&tos))),
    Arc::new(StringArray::from(as_deref(&ccs))),
    Arc::new(StringArray::from(as_deref(&bccs))),
    Arc::new(StringArray::from(subjects)),
    Arc::new(Int64Array::from(dates)),
    Arc::new(StringArray::from(bodies)),
    Arc::new(StringArray::from(htmls)),
    Arc::new(StringArray::from(snippets)),
    Arc::new(BooleanArray::from(has_attachments)),
    Arc::new(StringArray::from(as_deref(&attachments))),
    Arc::new(embeddings),
    Arc::new(BooleanArray::from(needs_embedding)),
    Arc::new(Int64Array::from(synced_ats)),
    Arc::new(UInt64Array::from(raw_sizes)),
  ];

  Ok(RecordBatch::try_new(mail_schema(), arrays)?)
}

fn as_deref(values: &[Option<String>]) -> Vec<Option<&str>> {
  values.iter().map(|v| v.as_deref()).collect()
}

/// Convert a record batch row back to a mail item
pub fn batch_to_mail(batch: &RecordBatch, row: usize) -> Result<MailItem> {
  let get = Accessors { batch, row };

  let references: Vec<String> = get.json_or_default("references");
  let labels: Vec<String> = get.json_or_default("labels");
  let flags: Vec<String> = get.json_or_default("flags");
  let to: Vec<Address> = get.json_or_default("to");
  let cc: Vec<Address> = get.json_or_default("cc");
  let bcc: Vec<Address> = get.json_or_default("bcc");
  let attachments: Vec<Attachment> = get.json_or_default("attachments");

  Ok(MailItem {
    id: get.string("id")?,
    account_id: get.string("account_id")?,
    account_alias: get.opt_string("account_alias"),
    message_id: get.string("message_id")?,
    provider_message_id: get.u64("provider_message_id")?,
    thread_id: get.u64("thread_id")?,
    uid: get.u32("uid")?,
    uid_validity: get.u32("uid_validity")?,
    in_reply_to: get.opt_string("in_reply_to"),
    references,
    folder: get.string("folder")?,
    labels,
    flags,
    from: Address {
      email: get.string("from_email")?,
      name: get.opt_string("from_name"),
    },
    to,
    cc,
    bcc,
    subject: get.string("subject")?,
    date: get.timestamp("date")?,
    body_plain: get.string("body_plain")?,
    body_html: get.opt_string("body_html"),
    snippet: get.string("snippet")?,
    attachments,
    embedding: None, // not materialised on reads
    needs_embedding: get.bool("needs_embedding")?,
    synced_at: get.timestamp("synced_at")?,
    raw_size: get.u64("raw_size")?,
  })
}

/// Convert calendar items to a record batch
pub fn events_to_batch(items: &[CalendarItem]) -> Result<RecordBatch> {
  let ids: Vec<&str> = items.iter().map(|e| e.id.as_str()).collect();
  let account_ids: Vec<&str> = items.iter().map(|e| e.account_id.as_str()).collect();
  let aliases: Vec<Option<&str>> = items.iter().map(|e| e.account_alias.as_deref()).collect();
  let provider_ids: Vec<&str> = items.iter().map(|e| e.provider_event_id.as_str()).collect();
  let ical_uids: Vec<&str> = items.iter().map(|e| e.ical_uid.as_str()).collect();
  let etags: Vec<&str> = items.iter().map(|e| e.etag.as_str()).collect();
  let summaries: Vec<&str> = items.iter().map(|e| e.summary.as_str()).collect();
  let descriptions: Vec<Option<&str>> = items.iter().map(|e| e.description.as_deref()).collect();
  let locations: Vec<Option<&str>> = items.iter().map(|e| e.location.as_deref()).collect();
  let starts: Vec<String> = items.iter().map(|e| e.start.to_wire()).collect();
  let ends: Vec<String> = items.iter().map(|e| e.end.to_wire()).collect();
  let start_ts: Vec<i64> = items.iter().map(|e| e.start.as_instant().timestamp()).collect();
  let end_ts: Vec<i64> = items.iter().map(|e| e.end.as_instant().timestamp()).collect();
  let timezones: Vec<&str> = items.iter().map(|e| e.timezone.as_str()).collect();
  let all_days: Vec<bool> = items.iter().map(|e| e.all_day).collect();
  let rules: Vec<Option<&str>> = items.iter().map(|e| e.recurrence_rule.as_deref()).collect();
  let recurrence_ids: Vec<Option<&str>> = items.iter().map(|e| e.recurrence_id.as_deref()).collect();
  let organizers: Vec<Option<String>> = items
    .iter()
    .map(|e| e.organizer.as_ref().map(serde_json::to_string).transpose())
    .collect::<std::result::Result<_, _>>()?;
  let attendees = items
    .iter()
    .map(|e| json_or_null(&e.attendees))
    .collect::<Result<Vec<_>>>()?;
  let statuses: Vec<&str> = items.iter().map(|e| e.status.as_str()).collect();
  let transparencies: Vec<&str> = items.iter().map(|e| e.transparency.as_str()).collect();
  let reminders = items
    .iter()
    .map(|e| json_or_null(&e.reminders))
    .collect::<Result<Vec<_>>>()?;
  let embeddings = embedding_array(items.iter().map(|e| e.embedding.as_ref()), items.len())?;
  let needs_embedding: Vec<bool> = items.iter().map(|e| e.needs_embedding).collect();
  let calendar_ids: Vec<&str> = items.iter().map(|e| e.calendar_id.as_str()).collect();
  let synced_ats: Vec<i64> = items.iter().map(|e| e.synced_at.timestamp()).collect();

  let arrays: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(ids)),
    Arc::new(StringArray::from(account_ids)),
    Arc::new(StringArray::from(aliases)),
    Arc::new(StringArray::from(provider_ids)),
    Arc::new(StringArray::from(ical_uids)),
    Arc::new(StringArray::from(etags)),
    Arc::new(StringArray::from(summaries)),
    Arc::new(StringArray::from(descriptions)),
    Arc::new(StringArray::from(locations)),
    Arc::new(StringArray::from(starts.iter().map(|s| s.as_str()).collect::<Vec<_>>())),
    Arc::new(StringArray::from(ends.iter().map(|s| s.as_str()).collect::<Vec<_>>())),
    Arc::new(Int64Array::from(start_ts)),
    Arc::new(Int64Array::from(end_ts)),
    Arc::new(StringArray::from(timezones)),
    Arc::new(BooleanArray::from(all_days)),
    Arc::new(StringArray::from(rules)),
    Arc::new(StringArray::from(recurrence_ids)),
    Arc::new(StringArray::from(as_deref(&organizers))),
    Arc::new(StringArray::from(as_deref(&attendees))),
    Arc::new(StringArray::from(statuses)),
    Arc::new(StringArray::from(transparencies)),
    Arc::new(StringArray::from(as_deref(&reminders))),
    Arc::new(embeddings),
    Arc::new(BooleanArray::from(needs_embedding)),
    Arc::new(StringArray::from(calendar_ids)),
    Arc::new(Int64Array::from(synced_ats)),
  ];

  Ok(RecordBatch::try_new(event_schema(), arrays)?)
}

/// Convert a record batch row back to a calendar item
pub fn batch_to_event(batch: &RecordBatch, row: usize) -> Result<CalendarItem> {
  let get = Accessors { batch, row };

  let start = EventTime::parse_wire(&get.string("start")?)
    .ok_or_else(|| StoreError::Decode("unparseable start time".into()))?;
  let end =
    EventTime::parse_wire(&get.string("end")?).ok_or_else(|| StoreError::Decode("unparseable end time".into()))?;

  let organizer: Option<Attendee> = get.opt_string("organizer").and_then(|s| serde_json::from_str(&s).ok());
  let attendees: Vec<Attendee> = get.json_or_default("attendees");
  let reminders: Vec<Reminder> = get.json_or_default("reminders");

  Ok(CalendarItem {
    id: get.string("id")?,
    account_id: get.string("account_id")?,
    account_alias: get.opt_string("account_alias"),
    provider_event_id: get.string("provider_event_id")?,
    ical_uid: get.string("ical_uid")?,
    etag: get.string("etag")?,
    summary: get.string("summary")?,
    description: get.opt_string("description"),
    location: get.opt_string("location"),
    start,
    end,
    timezone: get.string("timezone")?,
    all_day: get.bool("all_day")?,
    recurrence_rule: get.opt_string("recurrence_rule"),
    recurrence_id: get.opt_string("recurrence_id"),
    organizer,
    attendees,
    status: EventStatus::parse(&get.string("status")?),
    transparency: Transparency::parse(&get.string("transparency")?),
    reminders,
    embedding: None,
    needs_embedding: get.bool("needs_embedding")?,
    calendar_id: get.string("calendar_id")?,
    synced_at: get.timestamp("synced_at")?,
  })
}

/// Convert an account to a single-row record batch
pub fn account_to_batch(account: &Account) -> Result<RecordBatch> {
  let folders = json_or_null(&account.folders)?;
  let arrays: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(vec![account.id.as_str()])),
    Arc::new(StringArray::from(vec![account.alias.as_deref()])),
    Arc::new(StringArray::from(vec![account.display_name.as_str()])),
    Arc::new(StringArray::from(vec![account.status.as_str()])),
    Arc::new(Int64Array::from(vec![account.added_at.timestamp()])),
    Arc::new(Int64Array::from(vec![account.last_email_sync.map(|d| d.timestamp())])),
    Arc::new(Int64Array::from(vec![account.last_calendar_sync.map(|d| d.timestamp())])),
    Arc::new(BooleanArray::from(vec![account.sync_email])),
    Arc::new(BooleanArray::from(vec![account.sync_calendar])),
    Arc::new(StringArray::from(vec![folders.as_deref()])),
    Arc::new(BooleanArray::from(vec![account.sync_attachments])),
    Arc::new(Int64Array::from(vec![account.sync_email_since.map(|d| d.timestamp())])),
    Arc::new(Int64Array::from(vec![account.oldest_email_synced.map(|d| d.timestamp())])),
  ];

  Ok(RecordBatch::try_new(account_schema(), arrays)?)
}

/// Convert a record batch row back to an account
pub fn batch_to_account(batch: &RecordBatch, row: usize) -> Result<Account> {
  let get = Accessors { batch, row };
  let folders: Vec<String> = get.json_or_default("folders");

  Ok(Account {
    id: get.string("id")?,
    alias: get.opt_string("alias"),
    display_name: get.string("display_name")?,
    status: AccountStatus::parse(&get.string("status")?),
    added_at: get.timestamp("added_at")?,
    last_email_sync: get.opt_timestamp("last_email_sync"),
    last_calendar_sync: get.opt_timestamp("last_calendar_sync"),
    sync_email: get.bool("sync_email")?,
    sync_calendar: get.bool("sync_calendar")?,
    folders,
    sync_attachments: get.bool("sync_attachments")?,
    sync_email_since: get.opt_timestamp("sync_email_since"),
    oldest_email_synced: get.opt_timestamp("oldest_email_synced"),
  })
}

/// Typed column accessors for one row of a batch.
struct Accessors<'a> {
  batch: &'a RecordBatch,
  row: usize,
}

impl Accessors<'_> {
  fn column<T: 'static>(&self, name: &str) -> Option<&T> {
    self.batch.column_by_name(name).and_then(|c| c.as_any().downcast_ref::<T>())
  }

  fn string(&self, name: &str) -> Result<String> {
    self
      .column::<StringArray>(name)
      .map(|a| a.value(self.row).to_string())
      .ok_or_else(|| StoreError::Decode(format!("missing column {}", name)))
  }

  fn opt_string(&self, name: &str) -> Option<String> {
    self.column::<StringArray>(name).and_then(|a| {
      if a.is_null(self.row) {
        None
      } else {
        Some(a.value(self.row).to_string())
      }
    })
  }

  fn json_or_default<T: serde::de::DeserializeOwned + Default>(&self, name: &str) -> T {
    self
      .opt_string(name)
      .and_then(|s| serde_json::from_str(&s).ok())
      .unwrap_or_default()
  }

  fn u64(&self, name: &str) -> Result<u64> {
    self
      .column::<UInt64Array>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Decode(format!("missing column {}", name)))
  }

  fn u32(&self, name: &str) -> Result<u32> {
    self
      .column::<UInt32Array>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Decode(format!("missing column {}", name)))
  }

  fn i64(&self, name: &str) -> Result<i64> {
    self
      .column::<Int64Array>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Decode(format!("missing column {}", name)))
  }

  fn bool(&self, name: &str) -> Result<bool> {
    self
      .column::<BooleanArray>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Decode(format!("missing column {}", name)))
  }

  fn timestamp(&self, name: &str) -> Result<DateTime<Utc>> {
    let secs = self.i64(name)?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| StoreError::Decode(format!("invalid timestamp in {}", name)))
  }

  fn opt_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
    self.column::<Int64Array>(name).and_then(|a| {
      if a.is_null(self.row) {
        None
      } else {
        DateTime::from_timestamp(a.value(self.row), 0)
      }
    })
  }
}
