mod account;
mod attachment;
mod calendar;
mod mail;

pub use account::{Account, AccountStats, AccountStatus, SyncStatus, TotalStats};
pub use attachment::{Attachment, AttachmentSummary};
pub use calendar::{Attendee, AttendeeStatus, CalendarItem, EventStatus, EventTime, Reminder, ReminderMethod, Transparency};
pub use mail::{Address, MailItem, MailSummary, SendMailRequest};
