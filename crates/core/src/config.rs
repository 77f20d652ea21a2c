//! Operator configuration, loaded from `<config-dir>/config.toml`.
//!
//! Every recognised knob has a serde default so a missing file or a
//! partial file always yields a working configuration. Out-of-range
//! values are clamped at load time rather than rejected.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub general: GeneralConfig,

  #[serde(default)]
  pub sync: SyncConfig,

  #[serde(default)]
  pub search: SearchConfig,

  #[serde(default)]
  pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
  /// Log verbosity (debug, info, warn, error)
  #[serde(default = "default_log_level")]
  pub log_level: String,

  /// Data root; overrides the platform default
  #[serde(default = "default_data_dir")]
  pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
  fn default() -> Self {
    Self {
      log_level: default_log_level(),
      data_dir: default_data_dir(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
  /// Open IMAP IDLE channels for server push
  #[serde(default = "default_true")]
  pub email_idle_enabled: bool,

  /// Fallback poll cadence, clamped to 60-3600 s
  #[serde(default = "default_poll_interval")]
  pub email_poll_interval_secs: u64,

  /// Calendar poll cadence, clamped to 60-3600 s
  #[serde(default = "default_poll_interval")]
  pub calendar_poll_interval_secs: u64,

  /// Size of the shared fetch pool, clamped to 1-50
  #[serde(default = "default_concurrent_fetches")]
  pub max_concurrent_fetches: usize,

  /// Skip body fetches for attachments larger than this
  #[serde(default = "default_max_attachment_size")]
  pub attachment_max_size_mb: u64,

  /// Global Google API budget, requests per second
  #[serde(default = "default_rate_limit")]
  pub rate_limit_per_second: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      email_idle_enabled: true,
      email_poll_interval_secs: default_poll_interval(),
      calendar_poll_interval_secs: default_poll_interval(),
      max_concurrent_fetches: default_concurrent_fetches(),
      attachment_max_size_mb: default_max_attachment_size(),
      rate_limit_per_second: default_rate_limit(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
  /// Embedding model identifier; the vector width stays fixed at 768
  #[serde(default = "default_embedding_model")]
  pub embedding_model: String,

  /// Hardware-acceleration hint (Metal on macOS, CUDA elsewhere)
  #[serde(default = "default_true", alias = "use_metal")]
  pub use_gpu: bool,

  /// Body cap applied by get_mail and the ingest pipeline
  #[serde(default = "default_body_max_chars")]
  pub body_max_chars: usize,

  /// Reserved: fusion is plain RRF, weights are parsed for compatibility
  #[serde(default = "default_search_weight")]
  pub bm25_weight: f32,

  /// Reserved: fusion is plain RRF, weights are parsed for compatibility
  #[serde(default = "default_search_weight")]
  pub vector_weight: f32,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      embedding_model: default_embedding_model(),
      use_gpu: true,
      body_max_chars: default_body_max_chars(),
      bm25_weight: default_search_weight(),
      vector_weight: default_search_weight(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountsConfig {
  /// alias -> canonical email address
  #[serde(default)]
  pub aliases: HashMap<String, String>,

  /// Per-account overrides keyed by email address
  #[serde(flatten)]
  pub overrides: HashMap<String, AccountOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOverrides {
  #[serde(default = "default_true")]
  pub sync_enabled: bool,

  /// Folder allowlist; empty means all folders
  #[serde(default)]
  pub folders: Vec<String>,

  #[serde(default)]
  pub sync_attachments: bool,
}

impl Default for AccountOverrides {
  fn default() -> Self {
    Self {
      sync_enabled: true,
      folders: vec![],
      sync_attachments: false,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_poll_interval() -> u64 {
  300
}

fn default_concurrent_fetches() -> usize {
  10
}

fn default_max_attachment_size() -> u64 {
  100
}

fn default_rate_limit() -> u32 {
  10
}

fn default_embedding_model() -> String {
  "bge-base-en-v1.5".to_string()
}

fn default_body_max_chars() -> usize {
  40_000
}

fn default_search_weight() -> f32 {
  0.5
}

fn default_data_dir() -> PathBuf {
  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("groundeffect")
}

/// Platform config directory for config.toml, daemon.toml, and tokens/
pub fn config_dir() -> PathBuf {
  dirs::config_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("groundeffect")
}

impl Config {
  pub fn load() -> Result<Self> {
    Self::load_from(&config_dir().join("config.toml"))
  }

  pub fn load_from(path: &Path) -> Result<Self> {
    let mut config = if path.exists() {
      let contents = std::fs::read_to_string(path)?;
      let config: Config = toml::from_str(&contents)?;
      info!("loaded configuration from {:?}", path);
      config
    } else {
      info!("no config file at {:?}, using defaults", path);
      Config::default()
    };
    config.clamp();
    Ok(config)
  }

  pub fn save_to(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
  }

  fn clamp(&mut self) {
    self.sync.email_poll_interval_secs = self.sync.email_poll_interval_secs.clamp(60, 3600);
    self.sync.calendar_poll_interval_secs = self.sync.calendar_poll_interval_secs.clamp(60, 3600);
    self.sync.max_concurrent_fetches = self.sync.max_concurrent_fetches.clamp(1, 50);
    if self.sync.rate_limit_per_second == 0 {
      self.sync.rate_limit_per_second = default_rate_limit();
    }
  }

  pub fn lancedb_dir(&self) -> PathBuf {
    self.general.data_dir.join("lancedb")
  }

  pub fn attachments_dir(&self) -> PathBuf {
    self.general.data_dir.join("attachments")
  }

  pub fn models_dir(&self) -> PathBuf {
    self.general.data_dir.join("models")
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.general.data_dir.join("logs")
  }

  pub fn sync_state_dir(&self) -> PathBuf {
    self.general.data_dir.join("cache").join("sync_state")
  }

  pub fn writer_lock_path(&self) -> PathBuf {
    self.general.data_dir.join("writer.lock")
  }

  pub fn control_socket_path(&self) -> PathBuf {
    self.general.data_dir.join("daemon.sock")
  }

  pub fn tokens_dir() -> PathBuf {
    config_dir().join("tokens")
  }

  /// Resolve an identifier (alias or email) to a canonical address.
  /// Returns None for an unknown bare alias.
  pub fn resolve_account(&self, identifier: &str) -> Option<String> {
    if let Some(email) = self.accounts.aliases.get(identifier) {
      return Some(email.clone());
    }
    if identifier.contains('@') {
      return Some(identifier.to_string());
    }
    None
  }

  /// Alias configured for an address, if any.
  pub fn alias_for(&self, email: &str) -> Option<&str> {
    self
      .accounts
      .aliases
      .iter()
      .find(|(_, v)| v.as_str() == email)
      .map(|(k, _)| k.as_str())
  }

  pub fn account_overrides(&self, email: &str) -> AccountOverrides {
    self.accounts.overrides.get(email).cloned().unwrap_or_default()
  }
}

/// Daemon runtime configuration, stored separately at
/// `<config-dir>/daemon.toml` so the installer can rewrite it without
/// touching operator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
  #[serde(default = "default_true")]
  pub logging_enabled: bool,

  #[serde(default = "default_poll_interval")]
  pub email_poll_interval_secs: u64,

  #[serde(default = "default_poll_interval")]
  pub calendar_poll_interval_secs: u64,

  #[serde(default = "default_concurrent_fetches")]
  pub max_concurrent_fetches: usize,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      logging_enabled: true,
      email_poll_interval_secs: default_poll_interval(),
      calendar_poll_interval_secs: default_poll_interval(),
      max_concurrent_fetches: default_concurrent_fetches(),
    }
  }
}

impl DaemonConfig {
  pub fn load() -> Result<Self> {
    let path = config_dir().join("daemon.toml");
    if path.exists() {
      let contents = std::fs::read_to_string(&path)?;
      Ok(toml::from_str(&contents)?)
    } else {
      Ok(DaemonConfig::default())
    }
  }
}
