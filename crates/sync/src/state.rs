//! Per-account sync-state files.
//!
//! Owned exclusively by the writer process; readers never touch them.
//! Written atomically (tmp + rename) so a crash mid-save leaves the
//! previous state intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use groundeffect_core::Result;

/// Last known per-folder IMAP position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderState {
  /// UIDVALIDITY epoch the UIDs below belong to
  pub uid_validity: u32,
  /// Highest UID committed from this folder
  pub last_seen_uid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
  pub account_id: String,

  #[serde(default)]
  pub folders: HashMap<String, FolderState>,

  /// Opaque CalDAV change cursor
  #[serde(default)]
  pub calendar_sync_token: Option<String>,

  /// Oldest date backfill has reached; backfill continues below it
  #[serde(default)]
  pub backfill_cursor: Option<DateTime<Utc>>,

  /// Consecutive transient-failure count per task label
  #[serde(default)]
  pub retry_counts: HashMap<String, u32>,

  /// UIDs whose payloads failed to parse, per folder; never retried
  #[serde(default)]
  pub poison_uids: HashMap<String, BTreeSet<u32>>,
}

impl SyncState {
  pub fn new(account_id: impl Into<String>) -> Self {
    Self {
      account_id: account_id.into(),
      folders: HashMap::new(),
      calendar_sync_token: None,
      backfill_cursor: None,
      retry_counts: HashMap::new(),
      poison_uids: HashMap::new(),
    }
  }

  fn file_path(dir: &Path, account_id: &str) -> PathBuf {
    dir.join(format!("{}.json", account_id))
  }

  /// Load the state file, or a fresh state when none exists yet.
  pub fn load(dir: &Path, account_id: &str) -> Result<Self> {
    let path = Self::file_path(dir, account_id);
    if !path.exists() {
      return Ok(Self::new(account_id));
    }
    let data = std::fs::read_to_string(&path)?;
    let state = serde_json::from_str(&data)?;
    debug!("loaded sync state for {}", account_id);
    Ok(state)
  }

  /// Atomic save: write a sibling tmp file, then rename over the old one.
  pub fn save(&self, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = Self::file_path(dir, &self.account_id);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
  }

  pub fn delete(dir: &Path, account_id: &str) -> Result<()> {
    let path = Self::file_path(dir, account_id);
    if path.exists() {
      std::fs::remove_file(path)?;
    }
    Ok(())
  }

  pub fn folder(&self, name: &str) -> FolderState {
    self.folders.get(name).cloned().unwrap_or_default()
  }

  pub fn record_folder(&mut self, name: &str, uid_validity: u32, last_seen_uid: u32) {
    let entry = self.folders.entry(name.to_string()).or_default();
    entry.uid_validity = uid_validity;
    entry.last_seen_uid = entry.last_seen_uid.max(last_seen_uid);
  }

  /// Reset a folder to a new epoch; last-seen restarts from zero.
  pub fn reset_folder_epoch(&mut self, name: &str, uid_validity: u32) {
    self.folders.insert(
      name.to_string(),
      FolderState {
        uid_validity,
        last_seen_uid: 0,
      },
    );
    self.poison_uids.remove(name);
  }

  pub fn quarantine(&mut self, folder: &str, uid: u32) {
    self.poison_uids.entry(folder.to_string()).or_default().insert(uid);
  }

  pub fn is_poisoned(&self, folder: &str, uid: u32) -> bool {
    self.poison_uids.get(folder).map(|set| set.contains(&uid)).unwrap_or(false)
  }

  pub fn bump_retry(&mut self, label: &str) -> u32 {
    let count = self.retry_counts.entry(label.to_string()).or_insert(0);
    *count += 1;
    *count
  }

  pub fn clear_retry(&mut self, label: &str) {
    self.retry_counts.remove(label);
  }
}
