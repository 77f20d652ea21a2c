use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Event boundary: a point in time for timed events, a whole date for
/// all-day events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTime {
  DateTime(DateTime<Utc>),
  Date(NaiveDate),
}

impl EventTime {
  /// Stored wire form: RFC 3339 for timed events, YYYY-MM-DD for dates.
  pub fn to_wire(&self) -> String {
    match self {
      EventTime::DateTime(dt) => dt.to_rfc3339(),
      EventTime::Date(d) => d.to_string(),
    }
  }

  pub fn parse_wire(s: &str) -> Option<Self> {
    if s.contains('T') {
      DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| EventTime::DateTime(dt.with_timezone(&Utc)))
    } else {
      NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(EventTime::Date)
    }
  }

  /// Comparable instant (midnight UTC for whole dates), used for range
  /// filters and ordering.
  pub fn as_instant(&self) -> DateTime<Utc> {
    match self {
      EventTime::DateTime(dt) => *dt,
      EventTime::Date(d) => d
        .and_hms_opt(0, 0, 0)
        .map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc))
        .unwrap_or_else(Utc::now),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
  Confirmed,
  Tentative,
  Cancelled,
}

impl EventStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      EventStatus::Confirmed => "confirmed",
      EventStatus::Tentative => "tentative",
      EventStatus::Cancelled => "cancelled",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "tentative" => EventStatus::Tentative,
      "cancelled" => EventStatus::Cancelled,
      _ => EventStatus::Confirmed,
    }
  }
}

/// Whether the event blocks time on the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
  Busy,
  Free,
}

impl Transparency {
  pub fn as_str(&self) -> &'static str {
    match self {
      Transparency::Busy => "busy",
      Transparency::Free => "free",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "free" | "transparent" => Transparency::Free,
      _ => Transparency::Busy,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendeeStatus {
  NeedsAction,
  Accepted,
  Declined,
  Tentative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attendee {
  pub email: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_status: Option<AttendeeStatus>,
  #[serde(default)]
  pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderMethod {
  Popup,
  Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
  pub method: ReminderMethod,
  pub minutes: i32,
}

/// A synced calendar event. Recurring series store the master row plus
/// one row per exception instance, keyed by recurrence_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarItem {
  /// Internal id, stable across re-syncs: `<account>:<provider_event_id>`
  pub id: String,

  pub account_id: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub account_alias: Option<String>,

  pub provider_event_id: String,

  pub ical_uid: String,

  /// Server change tag; differing etag means the payload changed
  pub etag: String,

  pub summary: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,

  pub start: EventTime,

  pub end: EventTime,

  pub timezone: String,

  pub all_day: bool,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub recurrence_rule: Option<String>,

  /// Set on exception instances of a recurring series
  #[serde(skip_serializing_if = "Option::is_none")]
  pub recurrence_id: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub organizer: Option<Attendee>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub attendees: Vec<Attendee>,

  pub status: EventStatus,

  pub transparency: Transparency,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reminders: Vec<Reminder>,

  #[serde(skip)]
  pub embedding: Option<Vec<f32>>,

  #[serde(default)]
  pub needs_embedding: bool,

  pub calendar_id: String,

  pub synced_at: DateTime<Utc>,
}

impl CalendarItem {
  pub fn stable_id(account_id: &str, provider_event_id: &str) -> String {
    format!("{}:{}", account_id, provider_event_id)
  }

  /// Text fed to the embedder: summary doubled, then location,
  /// description, and attendee names.
  pub fn searchable_text(&self) -> String {
    let mut text = String::with_capacity(256);
    text.push_str(&self.summary);
    text.push_str(". ");
    text.push_str(&self.summary);
    text.push_str(". ");
    if let Some(location) = &self.location {
      text.push_str("Location: ");
      text.push_str(location);
      text.push_str(". ");
    }
    if let Some(description) = &self.description {
      text.push_str(description);
    }
    if !self.attendees.is_empty() {
      text.push_str(" Attendees:");
      for attendee in &self.attendees {
        text.push(' ');
        match &attendee.name {
          Some(name) => text.push_str(name),
          None => text.push_str(&attendee.email),
        }
      }
    }
    text
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_event_time_wire_round_trip() {
    let timed = EventTime::DateTime("2026-03-01T10:30:00Z".parse().unwrap());
    let parsed = EventTime::parse_wire(&timed.to_wire()).unwrap();
    assert_eq!(parsed, timed);

    let whole = EventTime::Date(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    assert_eq!(whole.to_wire(), "2026-03-01");
    assert_eq!(EventTime::parse_wire("2026-03-01").unwrap(), whole);
  }

  #[test]
  fn test_event_time_ordering_via_instant() {
    let date = EventTime::Date(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    let later = EventTime::DateTime("2026-03-01T08:00:00Z".parse().unwrap());
    assert!(date.as_instant() < later.as_instant());
  }

  #[test]
  fn test_transparency_accepts_ical_spelling() {
    assert_eq!(Transparency::parse("transparent"), Transparency::Free);
    assert_eq!(Transparency::parse("opaque"), Transparency::Busy);
  }

  #[test]
  fn test_searchable_text() {
    let item = CalendarItem {
      id: CalendarItem::stable_id("a@x.test", "ev1"),
      account_id: "a@x.test".into(),
      account_alias: None,
      provider_event_id: "ev1".into(),
      ical_uid: "ev1@google.com".into(),
      etag: "\"1\"".into(),
      summary: "Planning sync".into(),
      description: Some("Quarterly planning".into()),
      location: Some("Room 4".into()),
      start: EventTime::DateTime(Utc::now()),
      end: EventTime::DateTime(Utc::now()),
      timezone: "UTC".into(),
      all_day: false,
      recurrence_rule: None,
      recurrence_id: None,
      organizer: None,
      attendees: vec![Attendee {
        email: "pat@z.test".into(),
        name: Some("Pat".into()),
        response_status: Some(AttendeeStatus::Accepted),
        optional: false,
      }],
      status: EventStatus::Confirmed,
      transparency: Transparency::Busy,
      reminders: vec![],
      embedding: None,
      needs_embedding: false,
      calendar_id: "primary".into(),
      synced_at: Utc::now(),
    };

    let text = item.searchable_text();
    assert_eq!(text.matches("Planning sync").count(), 2);
    assert!(text.contains("Room 4"));
    assert!(text.contains("Pat"));
  }
}
