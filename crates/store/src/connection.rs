//! Store connection and table lifecycle.
//!
//! One process opens the store writable (after taking the writer lock);
//! any number of processes open it read-only. Readers see the manifest
//! that was current when their table handle was opened and call
//! `refresh` to pick up later commits; the writer never blocks on them.

use lancedb::index::Index;
use lancedb::index::scalar::FtsIndexBuilder;
use lancedb::{Connection, Table, connect};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::lock::WriterLock;
use crate::schema::{account_schema, event_schema, mail_schema};

pub const MAIL_TABLE: &str = "mail";
pub const EVENTS_TABLE: &str = "events";
pub const ACCOUNTS_TABLE: &str = "accounts";

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("lance error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("arrow error: {0}")]
  Arrow(#[from] arrow_schema::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("table not found: {0}")]
  TableNotFound(String),
  #[error("writer lock held by pid {pid}")]
  WriterLockHeld { pid: u32 },
  #[error("vector width {got}, schema requires {expected}")]
  VectorWidth { expected: usize, got: usize },
  #[error("decode error: {0}")]
  Decode(String),
  #[error("read-only store handle")]
  ReadOnly,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the on-disk store. `writable` is true only for the handle
/// holding the writer lock.
pub struct Store {
  pub(crate) connection: Connection,
  pub path: PathBuf,
  mail: RwLock<Option<Table>>,
  events: RwLock<Option<Table>>,
  accounts: RwLock<Option<Table>>,
  writable: bool,
  _lock: Option<WriterLock>,
}

impl Store {
  /// Open the store as the single writer. Acquires the lock first, then
  /// creates any missing tables and indexes.
  pub async fn open_writer(db_path: &Path, lock_path: &Path) -> Result<Self> {
    let lock = WriterLock::acquire(lock_path)?;

    if let Some(parent) = db_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    info!("opening store (writer) at {:?}", db_path);
    let connection = connect(db_path.to_string_lossy().as_ref()).execute().await?;

    let store = Self {
      connection,
      path: db_path.to_path_buf(),
      mail: RwLock::new(None),
      events: RwLock::new(None),
      accounts: RwLock::new(None),
      writable: true,
      _lock: Some(lock),
    };

    store.ensure_tables().await?;
    store.ensure_indexes().await?;
    Ok(store)
  }

  /// Open a read-only handle. Never creates tables or indexes; tolerates
  /// a store that the writer has not initialised yet by surfacing
  /// TableNotFound from the accessors.
  pub async fn open_reader(db_path: &Path) -> Result<Self> {
    info!("opening store (reader) at {:?}", db_path);
    let connection = connect(db_path.to_string_lossy().as_ref()).execute().await?;

    let store = Self {
      connection,
      path: db_path.to_path_buf(),
      mail: RwLock::new(None),
      events: RwLock::new(None),
      accounts: RwLock::new(None),
      writable: false,
      _lock: None,
    };

    store.refresh().await?;
    Ok(store)
  }

  pub fn is_writable(&self) -> bool {
    self.writable
  }

  async fn ensure_tables(&self) -> Result<()> {
    let names = self.connection.table_names().execute().await?;

    if !names.contains(&MAIL_TABLE.to_string()) {
      debug!("creating mail table");
      let table = self
        .connection
        .create_empty_table(MAIL_TABLE, mail_schema())
        .execute()
        .await?;
      *self.mail.write() = Some(table);
    } else {
      *self.mail.write() = Some(self.connection.open_table(MAIL_TABLE).execute().await?);
    }

    if !names.contains(&EVENTS_TABLE.to_string()) {
      debug!("creating events table");
      let table = self
        .connection
        .create_empty_table(EVENTS_TABLE, event_schema())
        .execute()
        .await?;
      *self.events.write() = Some(table);
    } else {
      *self.events.write() = Some(self.connection.open_table(EVENTS_TABLE).execute().await?);
    }

    if !names.contains(&ACCOUNTS_TABLE.to_string()) {
      debug!("creating accounts table");
      let table = self
        .connection
        .create_empty_table(ACCOUNTS_TABLE, account_schema())
        .execute()
        .await?;
      *self.accounts.write() = Some(table);
    } else {
      *self.accounts.write() = Some(self.connection.open_table(ACCOUNTS_TABLE).execute().await?);
    }

    Ok(())
  }

  /// Register the index configuration: FTS over the weighted text
  /// fields (subject/summary carry more weight than bodies, reflected by
  /// index order), BTree on id. The vector index is created lazily by
  /// `ensure_vector_indexes` once tables hold enough rows to train on.
  async fn ensure_indexes(&self) -> Result<()> {
    let mail = self.mail_table()?;
    let existing: std::collections::HashSet<String> = mail
      .list_indices()
      .await
      .unwrap_or_default()
      .into_iter()
      .flat_map(|idx| idx.columns)
      .collect();

    for column in ["subject", "body_plain", "from_email", "from_name"] {
      if !existing.contains(column) {
        if let Err(e) = mail
          .create_index(&[column], Index::FTS(FtsIndexBuilder::default()))
          .execute()
          .await
        {
          debug!("mail.{} FTS index: {}", column, e);
        }
      }
    }
    if !existing.contains("id") {
      if let Err(e) = mail.create_index(&["id"], Index::BTree(Default::default())).execute().await {
        debug!("mail.id index: {}", e);
      }
    }

    let events = self.events_table()?;
    let existing: std::collections::HashSet<String> = events
      .list_indices()
      .await
      .unwrap_or_default()
      .into_iter()
      .flat_map(|idx| idx.columns)
      .collect();

    for column in ["summary", "description", "location"] {
      if !existing.contains(column) {
        if let Err(e) = events
          .create_index(&[column], Index::FTS(FtsIndexBuilder::default()))
          .execute()
          .await
        {
          debug!("events.{} FTS index: {}", column, e);
        }
      }
    }
    if !existing.contains("id") {
      if let Err(e) = events
        .create_index(&["id"], Index::BTree(Default::default()))
        .execute()
        .await
      {
        debug!("events.id index: {}", e);
      }
    }

    Ok(())
  }

  /// Rebuild FTS indexes so fragments published since the last build
  /// become searchable. Called by the writer after commit batches land.
  pub async fn rebuild_fts(&self) -> Result<()> {
    if !self.writable {
      return Err(StoreError::ReadOnly);
    }
    let start = std::time::Instant::now();

    let mail = self.mail_table()?;
    for column in ["subject", "body_plain", "from_email", "from_name"] {
      if let Err(e) = mail
        .create_index(&[column], Index::FTS(FtsIndexBuilder::default()))
        .execute()
        .await
      {
        debug!("rebuild mail.{} FTS: {}", column, e);
      }
    }

    let events = self.events_table()?;
    for column in ["summary", "description", "location"] {
      if let Err(e) = events
        .create_index(&[column], Index::FTS(FtsIndexBuilder::default()))
        .execute()
        .await
      {
        debug!("rebuild events.{} FTS: {}", column, e);
      }
    }

    debug!("FTS rebuild took {:?}", start.elapsed());
    Ok(())
  }

  /// Re-open table handles at the latest manifest. Readers call this to
  /// observe commits made after they opened.
  pub async fn refresh(&self) -> Result<()> {
    let names = self.connection.table_names().execute().await?;
    if names.contains(&MAIL_TABLE.to_string()) {
      *self.mail.write() = Some(self.connection.open_table(MAIL_TABLE).execute().await?);
    }
    if names.contains(&EVENTS_TABLE.to_string()) {
      *self.events.write() = Some(self.connection.open_table(EVENTS_TABLE).execute().await?);
    }
    if names.contains(&ACCOUNTS_TABLE.to_string()) {
      *self.accounts.write() = Some(self.connection.open_table(ACCOUNTS_TABLE).execute().await?);
    }
    debug!("refreshed table handles");
    Ok(())
  }

  pub fn mail_table(&self) -> Result<Table> {
    self
      .mail
      .read()
      .clone()
      .ok_or_else(|| StoreError::TableNotFound(MAIL_TABLE.to_string()))
  }

  pub fn events_table(&self) -> Result<Table> {
    self
      .events
      .read()
      .clone()
      .ok_or_else(|| StoreError::TableNotFound(EVENTS_TABLE.to_string()))
  }

  pub fn accounts_table(&self) -> Result<Table> {
    self
      .accounts
      .read()
      .clone()
      .ok_or_else(|| StoreError::TableNotFound(ACCOUNTS_TABLE.to_string()))
  }

  pub(crate) fn require_writable(&self) -> Result<()> {
    if self.writable { Ok(()) } else { Err(StoreError::ReadOnly) }
  }

  /// Total bytes under the store directory, for status reporting.
  pub fn disk_usage_mb(&self) -> f64 {
    fn walk(path: &Path) -> u64 {
      let mut total = 0;
      if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
          if let Ok(meta) = entry.metadata() {
            if meta.is_dir() {
              total += walk(&entry.path());
            } else {
              total += meta.len();
            }
          }
        }
      }
      total
    }
    walk(&self.path) as f64 / (1024.0 * 1024.0)
  }
}
