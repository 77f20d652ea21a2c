//! Google Calendar adapter.
//!
//! The sync flow is sync-token driven: the first delta walks the
//! account's horizon, every later one sends the stored token and gets
//! back only adds, updates, and deletes. A 410 from the server means the
//! token aged out and the next delta starts over without one.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use groundeffect_core::{
  Attendee, AttendeeStatus, CalendarItem, Error, EventStatus, EventTime, Reminder, ReminderMethod, Result,
  TokenManager, Transparency,
};

use crate::rate_limit::RateLimiter;

const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, Clone)]
pub struct CalendarInfo {
  pub id: String,
  pub summary: String,
  pub primary: bool,
}

/// One sync-collection round: changed payloads, removed ids, and the
/// cursor for the next round.
#[derive(Debug, Clone, Default)]
pub struct CalendarDelta {
  pub changed: Vec<CalendarItem>,
  pub deleted: Vec<String>,
  pub next_sync_token: Option<String>,
}

/// Calendar provider capability. Tests substitute an in-memory fake.
#[async_trait]
pub trait CalendarAdapter: Send + Sync {
  async fn verify(&self) -> Result<()>;

  async fn list_calendars(&self) -> Result<Vec<CalendarInfo>>;

  /// Change set since `sync_token`; a None token walks the window from
  /// `window_start` forward.
  async fn delta(
    &self,
    calendar_id: &str,
    sync_token: Option<&str>,
    window_start: Option<DateTime<Utc>>,
  ) -> Result<CalendarDelta>;

  /// Refresh a single event by provider id.
  async fn fetch_event(&self, calendar_id: &str, provider_event_id: &str) -> Result<Option<CalendarItem>>;

  /// Returns (provider_event_id, etag).
  async fn create_event(&self, item: &CalendarItem) -> Result<(String, String)>;

  /// Returns the new etag.
  async fn update_event(&self, item: &CalendarItem) -> Result<String>;

  async fn delete_event(&self, calendar_id: &str, provider_event_id: &str) -> Result<()>;
}

pub struct GoogleCalendar {
  account_id: String,
  tokens: Arc<TokenManager>,
  limiter: Arc<RateLimiter>,
  client: Client,
}

impl GoogleCalendar {
  pub fn new(account_id: impl Into<String>, tokens: Arc<TokenManager>, limiter: Arc<RateLimiter>) -> Self {
    Self {
      account_id: account_id.into(),
      tokens,
      limiter,
      client: Client::new(),
    }
  }

  async fn bearer(&self) -> Result<String> {
    self.tokens.get_valid_token(&self.account_id).await
  }

  /// Map an unsuccessful calendar response to the right error class,
  /// honouring Retry-After on 429.
  fn classify(&self, status: reqwest::StatusCode, retry_after: Option<u64>, body: String) -> Error {
    match status.as_u16() {
      401 | 403 => Error::OAuth(format!("calendar API: {} {}", status, body)),
      429 => {
        let secs = retry_after.unwrap_or(30);
        self.limiter.suspend_for(Duration::from_secs(secs));
        Error::RateLimited { retry_after_secs: secs }
      }
      _ => Error::CalDav(format!("{}: {}", status, body)),
    }
  }

  fn parse_event(&self, json: &Value) -> Option<CalendarItem> {
    let id = json["id"].as_str()?;

    // Cancelled entries in a delta are deletion notices, handled by the
    // caller; everything else needs a start.
    let (start, all_day) = if let Some(date) = json["start"]["date"].as_str() {
      (EventTime::Date(NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?), true)
    } else if let Some(datetime) = json["start"]["dateTime"].as_str() {
      (
        EventTime::DateTime(DateTime::parse_from_rfc3339(datetime).ok()?.with_timezone(&Utc)),
        false,
      )
    } else {
      return None;
    };

    let end = if let Some(date) = json["end"]["date"].as_str() {
      NaiveDate::parse_from_str(date, "%Y-%m-%d").map(EventTime::Date).ok()?
    } else if let Some(datetime) = json["end"]["dateTime"].as_str() {
      EventTime::DateTime(DateTime::parse_from_rfc3339(datetime).ok()?.with_timezone(&Utc))
    } else {
      start.clone()
    };

    let attendee = |v: &Value| -> Option<Attendee> {
      Some(Attendee {
        email: v["email"].as_str()?.to_string(),
        name: v["displayName"].as_str().map(|s| s.to_string()),
        response_status: v["responseStatus"].as_str().and_then(|s| match s {
          "needsAction" => Some(AttendeeStatus::NeedsAction),
          "accepted" => Some(AttendeeStatus::Accepted),
          "declined" => Some(AttendeeStatus::Declined),
          "tentative" => Some(AttendeeStatus::Tentative),
          _ => None,
        }),
        optional: v["optional"].as_bool().unwrap_or(false),
      })
    };

    let reminders: Vec<Reminder> = json["reminders"]["overrides"]
      .as_array()
      .map(|overrides| {
        overrides
          .iter()
          .filter_map(|r| {
            Some(Reminder {
              method: match r["method"].as_str()? {
                "popup" => ReminderMethod::Popup,
                "email" => ReminderMethod::Email,
                _ => return None,
              },
              minutes: r["minutes"].as_i64()? as i32,
            })
          })
          .collect()
      })
      .unwrap_or_default();

    Some(CalendarItem {
      id: CalendarItem::stable_id(&self.account_id, id),
      account_id: self.account_id.clone(),
      account_alias: None,
      provider_event_id: id.to_string(),
      ical_uid: json["iCalUID"].as_str().unwrap_or(id).to_string(),
      etag: json["etag"].as_str().unwrap_or_default().to_string(),
      summary: json["summary"].as_str().unwrap_or("(no title)").to_string(),
      description: json["description"].as_str().map(|s| s.to_string()),
      location: json["location"].as_str().map(|s| s.to_string()),
      start,
      end,
      timezone: json["start"]["timeZone"].as_str().unwrap_or("UTC").to_string(),
      all_day,
      recurrence_rule: json["recurrence"]
        .as_array()
        .and_then(|rules| rules.first())
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()),
      recurrence_id: json["recurringEventId"].as_str().map(|s| s.to_string()),
      organizer: json["organizer"].as_object().and_then(|_| attendee(&json["organizer"])),
      attendees: json["attendees"]
        .as_array()
        .map(|list| list.iter().filter_map(attendee).collect())
        .unwrap_or_default(),
      status: EventStatus::parse(json["status"].as_str().unwrap_or("confirmed")),
      transparency: Transparency::parse(json["transparency"].as_str().unwrap_or("opaque")),
      reminders,
      embedding: None,
      needs_embedding: true,
      calendar_id: String::new(), // filled by the caller
      synced_at: Utc::now(),
    })
  }

  fn event_to_json(&self, item: &CalendarItem) -> Value {
    let time = |t: &EventTime| match t {
      EventTime::DateTime(dt) => serde_json::json!({ "dateTime": dt.to_rfc3339(), "timeZone": item.timezone }),
      EventTime::Date(d) => serde_json::json!({ "date": d.to_string() }),
    };

    let mut json = serde_json::json!({
      "summary": item.summary,
      "start": time(&item.start),
      "end": time(&item.end),
    });
    if let Some(description) = &item.description {
      json["description"] = Value::String(description.clone());
    }
    if let Some(location) = &item.location {
      json["location"] = Value::String(location.clone());
    }
    if !item.attendees.is_empty() {
      json["attendees"] = Value::Array(
        item
          .attendees
          .iter()
          .map(|a| serde_json::json!({ "email": a.email, "optional": a.optional }))
          .collect(),
      );
    }
    json
  }
}

#[async_trait]
impl CalendarAdapter for GoogleCalendar {
  async fn verify(&self) -> Result<()> {
    self.bearer().await.map(|_| ())
  }

  async fn list_calendars(&self) -> Result<Vec<CalendarInfo>> {
    self.limiter.acquire_for(&self.account_id).await?;
    let token = self.bearer().await?;

    let response = self
      .client
      .get(format!("{}/users/me/calendarList", CALENDAR_API))
      .bearer_auth(&token)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(self.classify(status, None, body));
    }

    let json: Value = response.json().await?;
    let calendars = json["items"]
      .as_array()
      .map(|items| {
        items
          .iter()
          .filter_map(|item| {
            Some(CalendarInfo {
              id: item["id"].as_str()?.to_string(),
              summary: item["summary"].as_str().unwrap_or_default().to_string(),
              primary: item["primary"].as_bool().unwrap_or(false),
            })
          })
          .collect()
      })
      .unwrap_or_default();
    Ok(calendars)
  }

  async fn delta(
    &self,
    calendar_id: &str,
    sync_token: Option<&str>,
    window_start: Option<DateTime<Utc>>,
  ) -> Result<CalendarDelta> {
    let mut delta = CalendarDelta::default();
    let mut page_token: Option<String> = None;

    loop {
      self.limiter.acquire_for(&self.account_id).await?;
      let token = self.bearer().await?;

      let mut request = self
        .client
        .get(format!("{}/calendars/{}/events", CALENDAR_API, calendar_id))
        .bearer_auth(&token)
        .query(&[("maxResults", "2500"), ("showDeleted", "true")]);

      match (sync_token, &page_token) {
        (_, Some(page)) => request = request.query(&[("pageToken", page.as_str())]),
        (Some(sync), None) => request = request.query(&[("syncToken", sync)]),
        (None, None) => {
          let time_min = window_start.unwrap_or_else(|| Utc::now() - chrono::Duration::days(365));
          request = request.query(&[("timeMin", &time_min.to_rfc3339())]);
        }
      }

      let response = request.send().await?;
      let status = response.status();

      if status.as_u16() == 410 {
        // Expired sync token: caller clears it and re-runs the window.
        warn!("calendar sync token expired for {}/{}", self.account_id, calendar_id);
        return Err(Error::CalDav("sync token expired".into()));
      }
      if !status.is_success() {
        let retry_after = response
          .headers()
          .get(reqwest::header::RETRY_AFTER)
          .and_then(|v| v.to_str().ok())
          .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(self.classify(status, retry_after, body));
      }

      let json: Value = response.json().await?;
      if let Some(items) = json["items"].as_array() {
        for item in items {
          if item["status"].as_str() == Some("cancelled") && item["start"].is_null() {
            if let Some(id) = item["id"].as_str() {
              delta.deleted.push(id.to_string());
            }
            continue;
          }
          if let Some(mut event) = self.parse_event(item) {
            event.calendar_id = calendar_id.to_string();
            delta.changed.push(event);
          } else {
            debug!("skipping calendar entry without usable times");
          }
        }
      }

      match json["nextPageToken"].as_str() {
        Some(next) => page_token = Some(next.to_string()),
        None => {
          delta.next_sync_token = json["nextSyncToken"].as_str().map(|s| s.to_string());
          break;
        }
      }
    }

    info!(
      "calendar delta for {}/{}: {} changed, {} deleted",
      self.account_id,
      calendar_id,
      delta.changed.len(),
      delta.deleted.len()
    );
    Ok(delta)
  }

  async fn fetch_event(&self, calendar_id: &str, provider_event_id: &str) -> Result<Option<CalendarItem>> {
    self.limiter.acquire_for(&self.account_id).await?;
    let token = self.bearer().await?;

    let response = self
      .client
      .get(format!(
        "{}/calendars/{}/events/{}",
        CALENDAR_API, calendar_id, provider_event_id
      ))
      .bearer_auth(&token)
      .send()
      .await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(self.classify(status, None, body));
    }

    let json: Value = response.json().await?;
    Ok(self.parse_event(&json).map(|mut event| {
      event.calendar_id = calendar_id.to_string();
      event
    }))
  }

  async fn create_event(&self, item: &CalendarItem) -> Result<(String, String)> {
    self.limiter.acquire_for(&self.account_id).await?;
    let token = self.bearer().await?;

    let response = self
      .client
      .post(format!("{}/calendars/{}/events", CALENDAR_API, item.calendar_id))
      .bearer_auth(&token)
      .json(&self.event_to_json(item))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(self.classify(status, None, body));
    }

    let json: Value = response.json().await?;
    let id = json["id"].as_str().unwrap_or_default().to_string();
    let etag = json["etag"].as_str().unwrap_or_default().to_string();
    info!("created event {} on {}", id, item.calendar_id);
    Ok((id, etag))
  }

  async fn update_event(&self, item: &CalendarItem) -> Result<String> {
    self.limiter.acquire_for(&self.account_id).await?;
    let token = self.bearer().await?;

    let response = self
      .client
      .put(format!(
        "{}/calendars/{}/events/{}",
        CALENDAR_API, item.calendar_id, item.provider_event_id
      ))
      .bearer_auth(&token)
      .json(&self.event_to_json(item))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(self.classify(status, None, body));
    }

    let json: Value = response.json().await?;
    Ok(json["etag"].as_str().unwrap_or_default().to_string())
  }

  async fn delete_event(&self, calendar_id: &str, provider_event_id: &str) -> Result<()> {
    self.limiter.acquire_for(&self.account_id).await?;
    let token = self.bearer().await?;

    let response = self
      .client
      .delete(format!(
        "{}/calendars/{}/events/{}",
        CALENDAR_API, calendar_id, provider_event_id
      ))
      .bearer_auth(&token)
      .send()
      .await?;

    // Already gone counts as done.
    if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(self.classify(status, None, body));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn adapter() -> GoogleCalendar {
    let vault = Arc::new(groundeffect_core::MemoryVault::new());
    let tokens = Arc::new(TokenManager::new(
      groundeffect_core::OAuthClientConfig {
        client_id: "id".into(),
        client_secret: "secret".into(),
      },
      vault,
    ));
    GoogleCalendar::new("a@x.test", tokens, Arc::new(RateLimiter::default()))
  }

  #[test]
  fn test_parse_timed_event() {
    let json = serde_json::json!({
      "id": "ev1",
      "etag": "\"3\"",
      "iCalUID": "ev1@google.com",
      "summary": "Planning",
      "status": "confirmed",
      "start": { "dateTime": "2026-04-01T09:00:00Z", "timeZone": "Europe/Berlin" },
      "end": { "dateTime": "2026-04-01T10:00:00Z" },
      "attendees": [
        { "email": "pat@z.test", "displayName": "Pat", "responseStatus": "accepted" }
      ],
      "reminders": { "overrides": [ { "method": "popup", "minutes": 10 } ] }
    });

    let event = adapter().parse_event(&json).unwrap();
    assert_eq!(event.provider_event_id, "ev1");
    assert_eq!(event.id, "a@x.test:ev1");
    assert!(!event.all_day);
    assert_eq!(event.timezone, "Europe/Berlin");
    assert_eq!(event.attendees.len(), 1);
    assert_eq!(event.attendees[0].response_status, Some(AttendeeStatus::Accepted));
    assert_eq!(event.reminders[0].minutes, 10);
    assert!(event.needs_embedding);
  }

  #[test]
  fn test_parse_all_day_event() {
    let json = serde_json::json!({
      "id": "ev2",
      "summary": "Offsite",
      "start": { "date": "2026-05-04" },
      "end": { "date": "2026-05-06" }
    });

    let event = adapter().parse_event(&json).unwrap();
    assert!(event.all_day);
    assert_eq!(event.start.to_wire(), "2026-05-04");
    assert_eq!(event.end.to_wire(), "2026-05-06");
  }

  #[test]
  fn test_parse_recurring_exception() {
    let json = serde_json::json!({
      "id": "ev3_20260504T090000Z",
      "summary": "Standup (moved)",
      "recurringEventId": "ev3",
      "start": { "dateTime": "2026-05-04T11:00:00Z" },
      "end": { "dateTime": "2026-05-04T11:15:00Z" }
    });

    let event = adapter().parse_event(&json).unwrap();
    assert_eq!(event.recurrence_id.as_deref(), Some("ev3"));
  }

  #[test]
  fn test_event_without_start_is_skipped() {
    let json = serde_json::json!({ "id": "ev4", "status": "cancelled" });
    assert!(adapter().parse_event(&json).is_none());
  }

  #[test]
  fn test_event_to_json_shapes() {
    let item = CalendarItem {
      id: "a@x.test:ev1".into(),
      account_id: "a@x.test".into(),
      account_alias: None,
      provider_event_id: "ev1".into(),
      ical_uid: "ev1@google.com".into(),
      etag: String::new(),
      summary: "Review".into(),
      description: Some("Agenda".into()),
      location: None,
      start: EventTime::DateTime("2026-04-01T09:00:00Z".parse().unwrap()),
      end: EventTime::DateTime("2026-04-01T10:00:00Z".parse().unwrap()),
      timezone: "UTC".into(),
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
      calendar_id: "primary".into(),
      synced_at: Utc::now(),
    };

    let json = adapter().event_to_json(&item);
    assert_eq!(json["summary"], "Review");
    assert_eq!(json["description"], "Agenda");
    assert!(json["start"]["dateTime"].is_string());
    assert!(json.get("location").is_none());
  }
}
