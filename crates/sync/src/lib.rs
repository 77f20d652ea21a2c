pub mod caldav;
pub mod idle;
pub mod imap;
pub mod ingest;
pub mod orchestrator;
pub mod rate_limit;
pub mod state;
pub mod task;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use caldav::{CalendarAdapter, CalendarDelta, CalendarInfo, GoogleCalendar};
pub use idle::{IdleEvent, IdleEventKind, IdleListener};
pub use imap::{EnvelopeSummary, FolderInfo, GmailImap, MailAdapter, MailboxEvent, sanitize_filename};
pub use ingest::{IngestPipeline, strip_html, truncate_chars};
pub use orchestrator::{
  AccountOrchestrator, AccountState, AdapterRegistry, MutationHint, StateEvent, SyncContext,
};
pub use rate_limit::RateLimiter;
pub use state::{FolderState, SyncState};
pub use task::{FetchTask, Priority, TaskKind, TaskQueue, UidSelection};
pub use worker::{FetchOutcome, OutcomeBus, run_worker};
