//! Fetch workers: the bounded pool consuming FetchTasks.
//!
//! Workers do the provider I/O and the ingest; every result or failure
//! is reported to the owning account's orchestrator through the outcome
//! bus. Workers never touch sync-state files.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use groundeffect_core::{Error, Result};
use store::WriteOp;

use crate::imap::FolderInfo;
use crate::orchestrator::SyncContext;
use crate::task::{FetchTask, Priority, TaskKind, UidSelection};

/// Body groups are capped by estimated response bytes.
const BODY_GROUP_BYTES: u64 = 4 * 1024 * 1024;
const BODY_GROUP_MESSAGES: usize = 50;
/// Groups above this take a large-body permit.
const LARGE_BODY_THRESHOLD: u64 = 1024 * 1024;
/// Days per reverse-chronological backfill window.
const BACKFILL_WINDOW_DAYS: i64 = 30;

#[derive(Debug)]
pub enum FetchOutcome {
  FoldersResolved {
    folders: Vec<FolderInfo>,
  },
  /// A body batch landed in the store.
  MailCommitted {
    folder: String,
    uid_validity: u32,
    count: usize,
    max_uid: u32,
    priority: Priority,
    /// Requested UIDs the server returned nothing parseable for
    poisoned: Vec<u32>,
  },
  /// A backfill window was scheduled; cursor moves to `window_start`.
  BackfillPlanned {
    folder: String,
    window_start: DateTime<Utc>,
    scheduled: usize,
  },
  CalendarCommitted {
    calendar_id: String,
    count: usize,
    deleted: usize,
    next_sync_token: Option<String>,
  },
  AttachmentSaved {
    mail_id: String,
    filename: String,
    path: PathBuf,
  },
  Failed {
    task: Box<FetchTask>,
    reason: String,
    transient: bool,
    auth: bool,
  },
}

/// Routes outcomes to the per-account orchestrator channels.
pub struct OutcomeBus {
  senders: RwLock<HashMap<String, mpsc::Sender<FetchOutcome>>>,
}

impl OutcomeBus {
  pub fn new() -> Self {
    Self {
      senders: RwLock::new(HashMap::new()),
    }
  }

  pub fn register(&self, account_id: &str) -> mpsc::Receiver<FetchOutcome> {
    let (tx, rx) = mpsc::channel(256);
    self.senders.write().insert(account_id.to_string(), tx);
    rx
  }

  pub fn unregister(&self, account_id: &str) {
    self.senders.write().remove(account_id);
  }

  pub async fn send(&self, account_id: &str, outcome: FetchOutcome) {
    let sender = self.senders.read().get(account_id).cloned();
    match sender {
      Some(sender) => {
        if sender.send(outcome).await.is_err() {
          debug!("orchestrator for {} is gone, dropping outcome", account_id);
        }
      }
      None => debug!("no orchestrator registered for {}", account_id),
    }
  }
}

impl Default for OutcomeBus {
  fn default() -> Self {
    Self::new()
  }
}

/// One worker loop; the daemon spawns `max_concurrent_fetches` of these.
pub async fn run_worker(ctx: Arc<SyncContext>, cancel: CancellationToken) {
  loop {
    let task = tokio::select! {
      _ = cancel.cancelled() => return,
      task = ctx.queue.pop() => task,
    };

    let account_id = task.account_id.clone();
    let outcomes = match execute(&ctx, task).await {
      Ok(outcomes) => outcomes,
      Err((task, e)) => {
        vec![FetchOutcome::Failed {
          reason: e.to_string(),
          transient: e.is_transient(),
          auth: e.requires_reauth(),
          task: Box::new(task),
        }]
      }
    };

    for outcome in outcomes {
      ctx.bus.send(&account_id, outcome).await;
    }
  }
}

type TaskResult = std::result::Result<Vec<FetchOutcome>, (FetchTask, Error)>;

async fn execute(ctx: &SyncContext, task: FetchTask) -> TaskResult {
  let run = run_task(ctx, &task).await;
  run.map_err(|e| (task, e))
}

async fn run_task(ctx: &SyncContext, task: &FetchTask) -> Result<Vec<FetchOutcome>> {
  let account_id = &task.account_id;

  match &task.kind {
    TaskKind::FolderList => {
      let adapter = ctx.adapters.mail(account_id)?;
      let names = adapter.list_folders().await?;
      let mut folders = Vec::with_capacity(names.len());
      for name in names {
        folders.push(adapter.select(&name).await?);
      }
      Ok(vec![FetchOutcome::FoldersResolved { folders }])
    }

    TaskKind::EnvelopeBatch { folder, selection } => {
      let adapter = ctx.adapters.mail(account_id)?;

      let uids = match selection {
        UidSelection::Explicit(uids) => uids.clone(),
        UidSelection::After(watermark) => adapter.search_after(folder, *watermark).await?,
      };
      if uids.is_empty() {
        return Ok(vec![]);
      }

      let envelopes = adapter.fetch_envelopes(folder, &uids).await?;

      // Group into body fetches bounded by total response size.
      let mut group: Vec<u32> = Vec::new();
      let mut group_bytes = 0u64;
      let mut scheduled = 0usize;
      for envelope in &envelopes {
        if !group.is_empty() && (group_bytes + envelope.size > BODY_GROUP_BYTES || group.len() >= BODY_GROUP_MESSAGES) {
          push_body_fetch(ctx, task, folder, std::mem::take(&mut group), group_bytes);
          scheduled += 1;
          group_bytes = 0;
        }
        group.push(envelope.uid);
        group_bytes += envelope.size;
      }
      if !group.is_empty() {
        push_body_fetch(ctx, task, folder, group, group_bytes);
        scheduled += 1;
      }

      debug!(
        "{}/{}: {} envelopes planned into {} body groups",
        account_id,
        folder,
        envelopes.len(),
        scheduled
      );
      Ok(vec![])
    }

    TaskKind::BodyFetch {
      folder,
      uids,
      estimated_bytes,
    } => {
      let adapter = ctx.adapters.mail(account_id)?;

      // Backfill pays per message from its own budget.
      if task.priority == Priority::Backfill {
        for _ in uids {
          ctx.limiter.acquire_backfill().await?;
        }
      } else {
        ctx.limiter.acquire_for(account_id).await?;
      }

      let _large = if *estimated_bytes > LARGE_BODY_THRESHOLD {
        ctx.limiter.large_body().acquire_owned().await.ok()
      } else {
        None
      };

      let items = adapter.fetch_bodies(folder, uids).await?;
      let uid_validity = items.first().map(|i| i.uid_validity).unwrap_or(0);
      let max_uid = items.iter().map(|i| i.uid).max().unwrap_or(0);
      let fetched: std::collections::HashSet<u32> = items.iter().map(|i| i.uid).collect();
      let poisoned: Vec<u32> = uids.iter().copied().filter(|u| !fetched.contains(u)).collect();

      let alias = ctx.config.alias_for(account_id).map(|s| s.to_string());
      let count = ctx.ingest.process_mail(items, alias.as_deref()).await?;

      Ok(vec![FetchOutcome::MailCommitted {
        folder: folder.clone(),
        uid_validity,
        count,
        max_uid,
        priority: task.priority,
        poisoned,
      }])
    }

    TaskKind::AttachmentFetch {
      folder,
      uid,
      mail_id,
      filename,
    } => {
      let adapter = ctx.adapters.mail(account_id)?;
      let (bytes, mime) = adapter.fetch_attachment(folder, *uid, filename).await?;

      let cap = ctx.config.sync.attachment_max_size_mb * 1024 * 1024;
      if bytes.len() as u64 > cap {
        warn!("attachment {} exceeds {} MB cap, skipping", filename, ctx.config.sync.attachment_max_size_mb);
        return Ok(vec![]);
      }

      let item = ctx.store.get_mail(mail_id).await.map_err(|e| Error::Store(e.to_string()))?;
      let message_dir = item
        .as_ref()
        .map(|i| crate::imap::sanitize_filename(&i.message_id))
        .unwrap_or_else(|| uid.to_string());

      let safe = crate::imap::sanitize_filename(filename);
      let dir = ctx.attachments_dir.join(account_id).join(message_dir);
      tokio::fs::create_dir_all(&dir).await?;
      let path = dir.join(&safe);
      tokio::fs::write(&path, &bytes).await?;

      if let Some(mut item) = item {
        let mut changed = false;
        for attachment in &mut item.attachments {
          if attachment.filename == *filename {
            attachment.local_path = Some(path.clone());
            attachment.mime_type = mime.clone();
            changed = true;
          }
        }
        if changed {
          ctx
            .store
            .set_mail_attachments(mail_id, &item.attachments)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        }
      }

      info!("saved attachment {} for {}", safe, mail_id);
      Ok(vec![FetchOutcome::AttachmentSaved {
        mail_id: mail_id.clone(),
        filename: filename.clone(),
        path,
      }])
    }

    TaskKind::CalDavDelta {
      calendar_id,
      sync_token,
      window_start,
    } => {
      let adapter = ctx.adapters.calendar(account_id)?;
      let delta = adapter.delta(calendar_id, sync_token.as_deref(), *window_start).await?;

      // Drop unchanged payloads by etag before embedding.
      let known = ctx
        .store
        .event_etags(account_id)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
      let changed: Vec<_> = delta
        .changed
        .into_iter()
        .filter(|event| known.get(&event.provider_event_id) != Some(&event.etag))
        .collect();

      let deleted = delta.deleted.len();
      if !delta.deleted.is_empty() {
        ctx
          .writer
          .submit(WriteOp::DeleteEvents {
            account_id: account_id.clone(),
            provider_event_ids: delta.deleted,
          })
          .await;
      }

      let alias = ctx.config.alias_for(account_id).map(|s| s.to_string());
      let count = ctx.ingest.process_events(changed, alias.as_deref()).await?;

      Ok(vec![FetchOutcome::CalendarCommitted {
        calendar_id: calendar_id.clone(),
        count,
        deleted,
        next_sync_token: delta.next_sync_token,
      }])
    }

    TaskKind::CalDavEvent {
      calendar_id,
      provider_event_id,
    } => {
      let adapter = ctx.adapters.calendar(account_id)?;
      let alias = ctx.config.alias_for(account_id).map(|s| s.to_string());

      match adapter.fetch_event(calendar_id, provider_event_id).await? {
        Some(event) => {
          let count = ctx.ingest.process_events(vec![event], alias.as_deref()).await?;
          Ok(vec![FetchOutcome::CalendarCommitted {
            calendar_id: calendar_id.clone(),
            count,
            deleted: 0,
            next_sync_token: None,
          }])
        }
        None => {
          // Provider says it no longer exists: remove it silently.
          ctx
            .writer
            .submit(WriteOp::DeleteEvents {
              account_id: account_id.clone(),
              provider_event_ids: vec![provider_event_id.clone()],
            })
            .await;
          Ok(vec![FetchOutcome::CalendarCommitted {
            calendar_id: calendar_id.clone(),
            count: 0,
            deleted: 1,
            next_sync_token: None,
          }])
        }
      }
    }

    TaskKind::BackfillWindow { folder, before, floor } => {
      let adapter = ctx.adapters.mail(account_id)?;

      let window_start = (*before - chrono::Duration::days(BACKFILL_WINDOW_DAYS)).max(*floor);
      let uids = adapter.search_since(folder, window_start, Some(*before)).await?;

      let mut scheduled = 0;
      for chunk in uids.chunks(BODY_GROUP_MESSAGES) {
        ctx.queue.push(FetchTask::new(
          account_id.clone(),
          TaskKind::BodyFetch {
            folder: folder.clone(),
            uids: chunk.to_vec(),
            estimated_bytes: 0,
          },
          Priority::Backfill,
        ));
        scheduled += chunk.len();
      }

      Ok(vec![FetchOutcome::BackfillPlanned {
        folder: folder.clone(),
        window_start,
        scheduled,
      }])
    }
  }
}

fn push_body_fetch(ctx: &SyncContext, task: &FetchTask, folder: &str, uids: Vec<u32>, estimated_bytes: u64) {
  ctx.queue.push(FetchTask::new(
    task.account_id.clone(),
    TaskKind::BodyFetch {
      folder: folder.to_string(),
      uids,
      estimated_bytes,
    },
    task.priority,
  ));
}
