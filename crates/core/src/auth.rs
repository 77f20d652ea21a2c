//! Access-token lifecycle against Google's token endpoint.
//!
//! Tokens refresh 5 minutes before expiry. A terminal refresh failure
//! (invalid_grant and friends) maps to the auth error class so the
//! orchestrator can park the account in NeedsReauth without touching
//! other accounts.

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::vault::{CredentialVault, OAuthTokens};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes the grant must cover: full IMAP, submit, full calendar, profile.
pub const OAUTH_SCOPES: &[&str] = &[
  "https://mail.google.com/",
  "https://www.googleapis.com/auth/gmail.send",
  "https://www.googleapis.com/auth/calendar",
  "https://www.googleapis.com/auth/userinfo.email",
  "https://www.googleapis.com/auth/userinfo.profile",
];

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  expires_in: i64,
  #[serde(default)]
  refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
  pub client_id: String,
  pub client_secret: String,
}

impl OAuthClientConfig {
  pub fn from_env() -> Self {
    Self {
      client_id: std::env::var("GROUNDEFFECT_CLIENT_ID").unwrap_or_default(),
      client_secret: std::env::var("GROUNDEFFECT_CLIENT_SECRET").unwrap_or_default(),
    }
  }
}

/// Hands out valid access tokens, refreshing through the vault as needed.
pub struct TokenManager {
  config: OAuthClientConfig,
  vault: Arc<dyn CredentialVault>,
  client: Client,
}

impl TokenManager {
  pub fn new(config: OAuthClientConfig, vault: Arc<dyn CredentialVault>) -> Self {
    Self {
      config,
      vault,
      client: Client::new(),
    }
  }

  pub fn vault(&self) -> Arc<dyn CredentialVault> {
    Arc::clone(&self.vault)
  }

  /// A non-expired access token for the account, refreshing if inside
  /// the 5-minute window.
  pub async fn get_valid_token(&self, account_id: &str) -> Result<String> {
    let tokens = self.vault.load(account_id).await?.ok_or_else(|| Error::TokenExpired {
      account: account_id.to_string(),
    })?;

    if !tokens.is_expired() {
      return Ok(tokens.access_token);
    }

    debug!("access token for {} inside refresh window, refreshing", account_id);
    self.refresh(account_id, tokens).await
  }

  /// Force a refresh using the stored refresh token.
  pub async fn refresh(&self, account_id: &str, tokens: OAuthTokens) -> Result<String> {
    let response = self
      .client
      .post(TOKEN_URL)
      .form(&[
        ("client_id", self.config.client_id.as_str()),
        ("client_secret", self.config.client_secret.as_str()),
        ("refresh_token", tokens.refresh_token.as_str()),
        ("grant_type", "refresh_token"),
      ])
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      // 4xx from the token endpoint means the grant itself is dead;
      // 5xx is the endpoint having a bad day.
      if status.is_client_error() {
        warn!("token refresh rejected for {}: {} {}", account_id, status, body);
        return Err(Error::TokenRefreshFailed {
          account: account_id.to_string(),
          reason: format!("{}: {}", status, body),
        });
      }
      return Err(Error::ConnectionFailed {
        host: "oauth2.googleapis.com".to_string(),
        reason: format!("{}: {}", status, body),
      });
    }

    let parsed: TokenResponse = response.json().await?;
    let refreshed = OAuthTokens {
      access_token: parsed.access_token.clone(),
      refresh_token: parsed.refresh_token.unwrap_or(tokens.refresh_token),
      expires_at: chrono::Utc::now().timestamp() + parsed.expires_in,
      scopes: tokens.scopes,
    };
    self.vault.save(account_id, &refreshed).await?;

    info!("refreshed access token for {}", account_id);
    Ok(refreshed.access_token)
  }
}

/// SASL XOAUTH2 initial response for IMAP authentication.
pub fn xoauth2_string(account_id: &str, access_token: &str) -> String {
  let raw = format!("user={}\x01auth=Bearer {}\x01\x01", account_id, access_token);
  STANDARD.encode(raw.as_bytes())
}
