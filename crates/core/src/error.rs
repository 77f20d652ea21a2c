use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the sync engine and the query server.
///
/// Variants map onto the handling classes the daemon distinguishes:
/// transient (retried with backoff), auth (account goes to NeedsReauth),
/// validation (request fails, store untouched), poison (quarantined),
/// and fatal (process exits non-zero).
#[derive(Error, Debug)]
pub enum Error {
  #[error("store error: {0}")]
  Store(String),

  #[error("writer lock held by pid {pid}")]
  WriterLockHeld { pid: u32 },

  #[error("OAuth error: {0}")]
  OAuth(String),

  #[error("token expired for account {account}")]
  TokenExpired { account: String },

  #[error("token refresh failed for account {account}: {reason}")]
  TokenRefreshFailed { account: String, reason: String },

  #[error("IMAP error: {0}")]
  Imap(String),

  #[error("CalDAV error: {0}")]
  CalDav(String),

  #[error("connection failed to {host}: {reason}")]
  ConnectionFailed { host: String, reason: String },

  #[error("rate limited, retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },

  #[error("malformed payload for {id}: {reason}")]
  Poison { id: String, reason: String },

  #[error("embedding error: {0}")]
  Embedding(String),

  #[error("model loading error: {0}")]
  ModelLoading(String),

  #[error("account not found: {0}")]
  AccountNotFound(String),

  #[error("mail item not found: {0}")]
  MailNotFound(String),

  #[error("event not found: {0}")]
  EventNotFound(String),

  #[error("invalid request: {0}")]
  BadRequest(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("TOML parse error: {0}")]
  TomlParse(#[from] toml::de::Error),

  #[error("cancelled")]
  Cancelled,

  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Whether the failure should be retried with backoff rather than
  /// surfaced. Auth and validation failures are never transient.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Error::ConnectionFailed { .. }
        | Error::RateLimited { .. }
        | Error::Http(_)
        | Error::Imap(_)
        | Error::CalDav(_)
        | Error::Io(_)
    )
  }

  /// Whether the owning account must transition to NeedsReauth.
  pub fn requires_reauth(&self) -> bool {
    matches!(
      self,
      Error::TokenExpired { .. } | Error::TokenRefreshFailed { .. } | Error::OAuth(_)
    )
  }

  /// Stable code for tool error envelopes.
  pub fn code(&self) -> &'static str {
    match self {
      Error::TokenExpired { .. } | Error::TokenRefreshFailed { .. } | Error::OAuth(_) => "AUTH_EXPIRED",
      Error::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
      Error::MailNotFound(_) => "MAIL_NOT_FOUND",
      Error::EventNotFound(_) => "EVENT_NOT_FOUND",
      Error::BadRequest(_) => "BAD_REQUEST",
      Error::RateLimited { .. } => "RATE_LIMITED",
      Error::Store(_) | Error::WriterLockHeld { .. } => "STORE_ERROR",
      Error::Imap(_) | Error::CalDav(_) | Error::ConnectionFailed { .. } => "SYNC_ERROR",
      Error::Embedding(_) | Error::ModelLoading(_) => "EMBEDDING_ERROR",
      Error::Config(_) | Error::TomlParse(_) => "CONFIG_ERROR",
      _ => "INTERNAL_ERROR",
    }
  }

  /// Operator-facing recovery hint for the error envelope's `action` field.
  pub fn action_hint(&self) -> Option<&'static str> {
    match self {
      Error::TokenExpired { .. } | Error::TokenRefreshFailed { .. } | Error::OAuth(_) => {
        Some("Re-authenticate the account through the OAuth flow")
      }
      Error::RateLimited { .. } => Some("Wait and retry"),
      Error::ConnectionFailed { .. } => Some("Check the network connection"),
      Error::WriterLockHeld { .. } => Some("Stop the other daemon process first"),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    assert!(
      Error::ConnectionFailed {
        host: "imap.gmail.com".into(),
        reason: "timeout".into()
      }
      .is_transient()
    );
    assert!(Error::RateLimited { retry_after_secs: 5 }.is_transient());
    assert!(!Error::BadRequest("bad limit".into()).is_transient());
    assert!(
      !Error::TokenExpired {
        account: "a@x.test".into()
      }
      .is_transient()
    );
  }

  #[test]
  fn test_reauth_classification() {
    assert!(
      Error::TokenRefreshFailed {
        account: "a@x.test".into(),
        reason: "invalid_grant".into()
      }
      .requires_reauth()
    );
    assert!(!Error::Imap("parse".into()).requires_reauth());
  }

  #[test]
  fn test_codes_are_stable() {
    assert_eq!(Error::BadRequest("x".into()).code(), "BAD_REQUEST");
    assert_eq!(Error::AccountNotFound("a".into()).code(), "ACCOUNT_NOT_FOUND");
    assert_eq!(Error::WriterLockHeld { pid: 1 }.code(), "STORE_ERROR");
  }
}
