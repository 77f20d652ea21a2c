pub mod accounts;
pub mod calendar;
pub mod connection;
pub mod lock;
pub mod mail;
pub mod query;
pub mod schema;
pub mod writer;

pub use connection::{Result, Store, StoreError};
pub use lock::WriterLock;
pub use query::{ScoredId, TableKind};
pub use writer::{StoreWriter, WriteOp, WriterHandle};
