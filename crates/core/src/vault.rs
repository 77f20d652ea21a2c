//! Credential vault: where OAuth bundles live.
//!
//! The daemon and query server only ever see the two-operation interface;
//! tests substitute an in-memory vault. Secrets never reach the store.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

/// OAuth bundle persisted per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
  pub access_token: String,
  pub refresh_token: String,
  /// Expiry as Unix seconds
  pub expires_at: i64,
  #[serde(default)]
  pub scopes: Vec<String>,
}

impl OAuthTokens {
  /// Expired, or expiring within the 5-minute refresh window.
  pub fn is_expired(&self) -> bool {
    self.expires_at < Utc::now().timestamp() + 300
  }
}

/// Pluggable token storage. Implementations must be Send + Sync; the
/// daemon shares one vault across all account orchestrators.
#[async_trait]
pub trait CredentialVault: Send + Sync {
  async fn load(&self, account_id: &str) -> Result<Option<OAuthTokens>>;
  async fn save(&self, account_id: &str, tokens: &OAuthTokens) -> Result<()>;
  async fn delete(&self, account_id: &str) -> Result<()>;
  async fn list(&self) -> Result<Vec<String>>;
}

/// File-backed vault storing `<config-dir>/tokens/<email>.json`, mode 0600.
pub struct FileVault {
  dir: PathBuf,
}

impl FileVault {
  pub fn new() -> Self {
    Self {
      dir: Config::tokens_dir(),
    }
  }

  pub fn with_dir(dir: PathBuf) -> Self {
    Self { dir }
  }

  fn token_path(&self, account_id: &str) -> PathBuf {
    self.dir.join(format!("{}.json", account_id))
  }

  fn ensure_dir(&self) -> Result<()> {
    if !self.dir.exists() {
      std::fs::create_dir_all(&self.dir)?;
      #[cfg(unix)]
      {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
      }
    }
    Ok(())
  }
}

impl Default for FileVault {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl CredentialVault for FileVault {
  async fn load(&self, account_id: &str) -> Result<Option<OAuthTokens>> {
    let path = self.token_path(account_id);
    if !path.exists() {
      return Ok(None);
    }
    let data = tokio::fs::read_to_string(&path).await?;
    let tokens: OAuthTokens = serde_json::from_str(&data)?;
    Ok(Some(tokens))
  }

  async fn save(&self, account_id: &str, tokens: &OAuthTokens) -> Result<()> {
    self.ensure_dir()?;
    let path = self.token_path(account_id);
    let data = serde_json::to_string_pretty(tokens)?;
    tokio::fs::write(&path, data).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    debug!("stored tokens for {}", account_id);
    Ok(())
  }

  async fn delete(&self, account_id: &str) -> Result<()> {
    let path = self.token_path(account_id);
    if path.exists() {
      tokio::fs::remove_file(&path).await?;
    }
    Ok(())
  }

  async fn list(&self) -> Result<Vec<String>> {
    if !self.dir.exists() {
      return Ok(vec![]);
    }
    let mut accounts = Vec::new();
    let mut entries = tokio::fs::read_dir(&self.dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if let Some(stem) = name.strip_suffix(".json") {
        accounts.push(stem.to_string());
      }
    }
    accounts.sort();
    Ok(accounts)
  }
}

/// In-memory vault for tests and ephemeral runs.
pub struct MemoryVault {
  tokens: parking_lot::RwLock<std::collections::HashMap<String, OAuthTokens>>,
}

impl MemoryVault {
  pub fn new() -> Self {
    Self {
      tokens: parking_lot::RwLock::new(std::collections::HashMap::new()),
    }
  }
}

impl Default for MemoryVault {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl CredentialVault for MemoryVault {
  async fn load(&self, account_id: &str) -> Result<Option<OAuthTokens>> {
    Ok(self.tokens.read().get(account_id).cloned())
  }

  async fn save(&self, account_id: &str, tokens: &OAuthTokens) -> Result<()> {
    self.tokens.write().insert(account_id.to_string(), tokens.clone());
    Ok(())
  }

  async fn delete(&self, account_id: &str) -> Result<()> {
    self.tokens.write().remove(account_id);
    Ok(())
  }

  async fn list(&self) -> Result<Vec<String>> {
    let mut accounts: Vec<String> = self.tokens.read().keys().cloned().collect();
    accounts.sort();
    Ok(accounts)
  }
}

/// Require tokens for an account, mapping absence to the auth error class.
pub async fn require_tokens(vault: &dyn CredentialVault, account_id: &str) -> Result<OAuthTokens> {
  vault.load(account_id).await?.ok_or_else(|| Error::TokenExpired {
    account: account_id.to_string(),
  })
}
