use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a connected account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
  /// Synced and listening
  Active,
  /// Initial sync or catch-up in progress
  Syncing,
  /// Token refresh failed terminally; no fetches until re-auth
  NeedsReauth,
  /// Quiesced by the operator
  Disabled,
}

impl Default for AccountStatus {
  fn default() -> Self {
    Self::Active
  }
}

impl AccountStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      AccountStatus::Active => "active",
      AccountStatus::Syncing => "syncing",
      AccountStatus::NeedsReauth => "needs_reauth",
      AccountStatus::Disabled => "disabled",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "syncing" => AccountStatus::Syncing,
      "needs_reauth" => AccountStatus::NeedsReauth,
      "disabled" => AccountStatus::Disabled,
      _ => AccountStatus::Active,
    }
  }
}

/// A connected Gmail / Google Calendar identity, keyed by its canonical
/// email address. Created when the OAuth grant completes; mutated only by
/// the writer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
  /// Canonical email address (primary key)
  pub id: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub alias: Option<String>,

  pub display_name: String,

  pub status: AccountStatus,

  pub added_at: DateTime<Utc>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_email_sync: Option<DateTime<Utc>>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_calendar_sync: Option<DateTime<Utc>>,

  #[serde(default = "default_true")]
  pub sync_email: bool,

  #[serde(default = "default_true")]
  pub sync_calendar: bool,

  /// Folder allowlist; empty means every folder
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub folders: Vec<String>,

  #[serde(default)]
  pub sync_attachments: bool,

  /// Historical floor for backfill. None means the 90-day default window.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sync_email_since: Option<DateTime<Utc>>,

  /// Oldest mail date reached by backfill so far
  #[serde(skip_serializing_if = "Option::is_none")]
  pub oldest_email_synced: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
  true
}

impl Account {
  pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
    Self {
      id: email.into(),
      alias: None,
      display_name: display_name.into(),
      status: AccountStatus::Active,
      added_at: Utc::now(),
      last_email_sync: None,
      last_calendar_sync: None,
      sync_email: true,
      sync_calendar: true,
      folders: vec![],
      sync_attachments: false,
      sync_email_since: None,
      oldest_email_synced: None,
    }
  }

  pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
    self.alias = Some(alias.into());
    self
  }

  pub fn with_sync_attachments(mut self, enabled: bool) -> Self {
    self.sync_attachments = enabled;
    self
  }

  /// Backfill floor expressed as years before now. Zero keeps the
  /// default 90-day window.
  pub fn with_years_to_sync(mut self, years: u32) -> Self {
    if years > 0 {
      self.sync_email_since = Some(Utc::now() - Duration::days(years as i64 * 365));
    }
    self
  }

  /// Whether an identifier (email or alias) names this account.
  pub fn matches(&self, identifier: &str) -> bool {
    self.id.eq_ignore_ascii_case(identifier)
      || self
        .alias
        .as_ref()
        .map(|a| a.eq_ignore_ascii_case(identifier))
        .unwrap_or(false)
  }

  /// Start of the recent window used by priming: the configured floor,
  /// or 90 days back.
  pub fn recent_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    self.sync_email_since.unwrap_or(now - Duration::days(90))
  }
}

/// Per-account counters reported by get_sync_status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStats {
  pub id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub alias: Option<String>,
  pub status: AccountStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_email_sync: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_calendar_sync: Option<DateTime<Utc>>,
  pub email_count: u64,
  pub event_count: u64,
}

/// Aggregate counters across all accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalStats {
  pub email_count: u64,
  pub event_count: u64,
  pub index_size_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
  pub accounts: Vec<AccountStats>,
  pub totals: TotalStats,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_matches_alias_and_email() {
    let account = Account::new("jamie@company.test", "Jamie").with_alias("work");
    assert!(account.matches("work"));
    assert!(account.matches("WORK"));
    assert!(account.matches("Jamie@Company.Test"));
    assert!(!account.matches("personal"));
  }

  #[test]
  fn test_recent_window_default_is_90_days() {
    let account = Account::new("a@x.test", "A");
    let now = Utc::now();
    let start = account.recent_window_start(now);
    assert_eq!((now - start).num_days(), 90);
  }

  #[test]
  fn test_years_to_sync() {
    let account = Account::new("a@x.test", "A").with_years_to_sync(2);
    let since = account.sync_email_since.unwrap();
    assert!((Utc::now() - since).num_days() >= 729);

    let default = Account::new("a@x.test", "A").with_years_to_sync(0);
    assert!(default.sync_email_since.is_none());
  }

  #[test]
  fn test_status_round_trip() {
    for status in [
      AccountStatus::Active,
      AccountStatus::Syncing,
      AccountStatus::NeedsReauth,
      AccountStatus::Disabled,
    ] {
      assert_eq!(AccountStatus::parse(status.as_str()), status);
    }
  }
}
