pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod vault;

pub use config::{AccountOverrides, Config, DaemonConfig, GeneralConfig, SearchConfig, SyncConfig};
pub use error::{Error, Result};
pub use models::{
  Account, AccountStats, AccountStatus, Address, Attachment, AttachmentSummary, Attendee, AttendeeStatus,
  CalendarItem, EventStatus, EventTime, MailItem, MailSummary, Reminder, ReminderMethod, SendMailRequest, SyncStatus,
  TotalStats, Transparency,
};
pub use auth::{OAuthClientConfig, TokenManager, xoauth2_string};
pub use vault::{CredentialVault, FileVault, MemoryVault, OAuthTokens};

/// Vector width of the embedding column. Schema-fixed; every row carries
/// exactly this many f32 components.
pub const EMBEDDING_DIM: usize = 768;
