pub mod mutations;
pub mod search;
pub mod tools;

pub use mutations::{GmailSubmitter, MailSubmitter, MutationRouter};
pub use search::{CalendarSearchOptions, MailSearchOptions, SearchEngine, SearchResponse};
pub use tools::ToolHandler;
